// src/summary.rs
//! Rate-limited publishing of the latest portfolio snapshot.

use anyhow::Result;
use tracing::{debug, info};

use crate::queue::QueueStore;
use crate::types::PortfolioSummary;

pub struct SummaryPublisher {
    key: String,
    interval_ms: i64,
    last_published: Option<i64>,
}

impl SummaryPublisher {
    pub fn new(key: &str, interval_ms: u64) -> Self {
        Self {
            key: key.to_string(),
            interval_ms: interval_ms as i64,
            last_published: None,
        }
    }

    pub fn last_published(&self) -> Option<i64> {
        self.last_published
    }

    /// Write the summary when at least one interval has passed since the last
    /// write. Returns whether it was written.
    pub fn maybe_publish(&mut self, store: &QueueStore, summary: &PortfolioSummary) -> Result<bool> {
        if let Some(last) = self.last_published {
            if summary.timestamp - last < self.interval_ms {
                return Ok(false);
            }
        }
        self.publish(store, summary)?;
        Ok(true)
    }

    /// Unconditional write, used on shutdown
    pub fn publish(&mut self, store: &QueueStore, summary: &PortfolioSummary) -> Result<()> {
        store.set_summary(&self.key, summary)?;
        self.last_published = Some(summary.timestamp);
        debug!(
            "[PORTFOLIO] value={:.2} cash={:.2} inv={:.6} return={:+.3}%",
            summary.portfolio_value, summary.cash, summary.inventory, summary.return_pct
        );
        if summary.net_profit != 0.0 {
            info!("[PORTFOLIO] Net profit {:+.4}", summary.net_profit);
        }
        Ok(())
    }
}
