//! Training progress tracking for the DQN trainer
//!
//! Sliding-window loss and reward averages, action distribution of consumed
//! experiences and a readiness heuristic, reported through periodic log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::Signal;

/// Maximum history size for loss/reward tracking
const DEFAULT_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    losses: VecDeque<f32>,
    rewards: VecDeque<f32>,
    /// Consumed experiences per action: [BUY, SELL, HOLD]
    action_counts: [u64; 3],
    pub total_steps: u64,
    pub total_experiences: u64,
    pub dropped_experiences: u64,
    pub checkpoints_saved: u64,
    pub target_syncs: u64,
    window_size: usize,
    min_steps_for_ready: u64,
    loss_threshold: f32,
    started_at: DateTime<Utc>,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, 1000, 0.05)
    }
}

/// Serializable point-in-time view for logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_steps: u64,
    pub total_experiences: u64,
    pub dropped_experiences: u64,
    pub avg_loss: Option<f32>,
    pub avg_reward: f32,
    pub action_distribution: [f32; 3],
    pub ready: bool,
    pub uptime_secs: i64,
}

impl TrainingMetrics {
    /// * `window_size` - Size of sliding window for moving averages
    /// * `min_steps_for_ready` - Minimum gradient steps before the model can be "ready"
    /// * `loss_threshold` - Average loss must be below this to be ready
    pub fn new(window_size: usize, min_steps_for_ready: u64, loss_threshold: f32) -> Self {
        Self {
            losses: VecDeque::with_capacity(window_size),
            rewards: VecDeque::with_capacity(window_size),
            action_counts: [0; 3],
            total_steps: 0,
            total_experiences: 0,
            dropped_experiences: 0,
            checkpoints_saved: 0,
            target_syncs: 0,
            window_size,
            min_steps_for_ready,
            loss_threshold,
            started_at: Utc::now(),
        }
    }

    pub fn record_step(&mut self, loss: f32) {
        if self.losses.len() >= self.window_size {
            self.losses.pop_front();
        }
        self.losses.push_back(loss);
        self.total_steps += 1;
    }

    pub fn record_experience(&mut self, signal: Signal, reward: f32) {
        if self.rewards.len() >= self.window_size {
            self.rewards.pop_front();
        }
        self.rewards.push_back(reward);
        self.action_counts[signal.action_index()] += 1;
        self.total_experiences += 1;
    }

    pub fn record_dropped(&mut self) {
        self.dropped_experiences += 1;
    }

    pub fn avg_loss(&self) -> Option<f32> {
        if self.losses.is_empty() {
            return None;
        }
        Some(self.losses.iter().sum::<f32>() / self.losses.len() as f32)
    }

    pub fn avg_reward(&self) -> f32 {
        if self.rewards.is_empty() {
            return 0.0;
        }
        self.rewards.iter().sum::<f32>() / self.rewards.len() as f32
    }

    /// Fractions of consumed experiences per action [BUY, SELL, HOLD]
    pub fn action_distribution(&self) -> [f32; 3] {
        let total: u64 = self.action_counts.iter().sum();
        if total == 0 {
            return [0.0; 3];
        }
        self.action_counts.map(|c| c as f32 / total as f32)
    }

    /// Loss stabilizing: coefficient of variation below 0.3 over a half-full window
    pub fn is_loss_stable(&self) -> bool {
        let Some(mean) = self.avg_loss() else {
            return false;
        };
        if self.losses.len() < self.window_size / 2 {
            return false;
        }
        let variance =
            self.losses.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / self.losses.len() as f32;
        variance.sqrt() / mean.abs().max(0.001) < 0.3
    }

    pub fn is_ready(&self) -> bool {
        self.total_steps >= self.min_steps_for_ready
            && self.avg_loss().is_some_and(|l| l < self.loss_threshold)
            && self.is_loss_stable()
    }

    pub fn readiness_status(&self) -> String {
        let steps_pct =
            (self.total_steps as f32 / self.min_steps_for_ready.max(1) as f32 * 100.0).min(100.0);
        let loss_ok = self.avg_loss().is_some_and(|l| l < self.loss_threshold);
        format!(
            "Steps: {}/{} ({:.0}%) | Loss: {} {} | Stable: {} | Ready: {}",
            self.total_steps,
            self.min_steps_for_ready,
            steps_pct,
            self.avg_loss().map(|l| format!("{:.5}", l)).unwrap_or_else(|| "-".to_string()),
            if loss_ok { "✓" } else { "✗" },
            if self.is_loss_stable() { "✓" } else { "✗" },
            if self.is_ready() { "YES" } else { "NO" }
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_steps: self.total_steps,
            total_experiences: self.total_experiences,
            dropped_experiences: self.dropped_experiences,
            avg_loss: self.avg_loss(),
            avg_reward: self.avg_reward(),
            action_distribution: self.action_distribution(),
            ready: self.is_ready(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}
