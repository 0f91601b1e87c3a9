// src/queue.rs
//! Durable store shared by the inference and training processes.
//!
//! One SQLite file holds named FIFO lists (the experience queue, the signal
//! history) and a key/value table (latest portfolio summary). WAL mode lets
//! the producer and the consumer work on the same file concurrently.
//!
//! Pop deletes and returns the oldest row in a single statement, so delivery
//! is at-most-once: an item popped by a consumer that then crashes is gone.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{Experience, PortfolioSummary, TradeRecord};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of popping one experience
#[derive(Debug, Clone, PartialEq)]
pub enum Popped {
    Empty,
    Experience(Experience),
    /// The row was removed but could not be decoded
    Malformed,
}

pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl QueueStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening queue store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS lists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS lists_name_id ON lists(name, id);
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("creating queue tables")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("queue store lock poisoned"))
    }

    /// Append to the tail of a list
    pub fn push(&self, list: &str, payload: &str) -> Result<()> {
        self.conn()?
            .execute("INSERT INTO lists (name, payload) VALUES (?1, ?2)", params![list, payload])
            .with_context(|| format!("pushing to {}", list))?;
        Ok(())
    }

    /// Remove and return the head of a list; never blocks on an empty list
    pub fn pop(&self, list: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "DELETE FROM lists
                 WHERE id = (SELECT MIN(id) FROM lists WHERE name = ?1)
                 RETURNING payload",
                params![list],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("popping from {}", list))
    }

    pub fn len(&self, list: &str) -> Result<usize> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM lists WHERE name = ?1",
            params![list],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Keep only the newest `keep` entries of a list
    pub fn trim(&self, list: &str, keep: usize) -> Result<usize> {
        let removed = self.conn()?.execute(
            "DELETE FROM lists WHERE name = ?1 AND id NOT IN
                (SELECT id FROM lists WHERE name = ?1 ORDER BY id DESC LIMIT ?2)",
            params![list, keep as i64],
        )?;
        Ok(removed)
    }

    /// Newest `limit` entries, oldest first
    pub fn tail(&self, list: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM
                (SELECT id, payload FROM lists WHERE name = ?1 ORDER BY id DESC LIMIT ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![list, limit as i64], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(Into::into)
    }

    /// Overwrite a single key
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn push_experience(&self, list: &str, exp: &Experience) -> Result<()> {
        self.push(list, &exp.to_json()?)
    }

    /// Pop and decode one experience; undecodable rows are dropped
    pub fn pop_experience(&self, list: &str) -> Result<Popped> {
        let Some(raw) = self.pop(list)? else {
            return Ok(Popped::Empty);
        };
        match Experience::from_json(&raw) {
            Ok(exp) => Ok(Popped::Experience(exp)),
            Err(e) => {
                warn!("[QUEUE] Dropping malformed experience: {}", e);
                debug!("[QUEUE] Raw payload: {}", raw);
                Ok(Popped::Malformed)
            }
        }
    }

    /// Append a trade record and trim the history to `max_len`
    pub fn push_signal_record(&self, list: &str, record: &TradeRecord, max_len: usize) -> Result<()> {
        self.push(list, &serde_json::to_string(record)?)?;
        self.trim(list, max_len)?;
        Ok(())
    }

    pub fn set_summary(&self, key: &str, summary: &PortfolioSummary) -> Result<()> {
        self.set(key, &serde_json::to_string(summary)?)
    }
}
