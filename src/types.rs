// src/types.rs
//! Shared data types passed between the inference and training sides.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single trade event from the market feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: f64,
    pub quantity: f64,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl Tick {
    pub fn new(price: f64, quantity: f64, timestamp: i64) -> Self {
        Self { price, quantity, timestamp }
    }
}

/// Trade action decided for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Model output ordering: [BUY, SELL, HOLD]
    pub const ACTION_SPACE: [Signal; 3] = [Signal::Buy, Signal::Sell, Signal::Hold];

    /// Signed action stored in experiences (1 / -1 / 0)
    pub fn to_action(self) -> i8 {
        match self {
            Signal::Buy => 1,
            Signal::Sell => -1,
            Signal::Hold => 0,
        }
    }

    /// Unknown values map to Hold
    pub fn from_action(action: i8) -> Self {
        match action {
            1 => Signal::Buy,
            -1 => Signal::Sell,
            _ => Signal::Hold,
        }
    }

    /// Index into the network's output layer
    pub fn action_index(self) -> usize {
        match self {
            Signal::Buy => 0,
            Signal::Sell => 1,
            Signal::Hold => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ACTION_SPACE.get(index).copied()
    }

    pub fn is_trade(self) -> bool {
        !matches!(self, Signal::Hold)
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One (state, action, reward, next_state, done) training tuple.
///
/// Wire format on the durable queue is this struct as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f32>,
    pub action: i8,
    pub reward: f32,
    pub next_state: Vec<f32>,
    pub done: bool,
    /// Trade size used for the action, appended as the last model input
    #[serde(default = "default_experience_quantity")]
    pub quantity: f64,
}

fn default_experience_quantity() -> f64 {
    crate::config::DEFAULT_TRADE_SIZE
}

impl Experience {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn signal(&self) -> Signal {
        Signal::from_action(self.action)
    }
}

/// Observability record appended to the signal-history list every cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub signal: Signal,
    pub price: f64,
    pub quantity: f64,
    pub cash: f64,
    pub inventory: f64,
    pub reason: String,
    pub forced: bool,
    pub votes: Vec<Signal>,
    pub take_profit_pct: f64,
    pub model_version: String,
    pub reward: Option<f64>,
    pub features: Vec<(String, f64)>,
}

/// Latest portfolio snapshot published to the summary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub timestamp: i64,
    pub cash: f64,
    pub inventory: f64,
    pub price: f64,
    pub portfolio_value: f64,
    pub net_profit: f64,
    pub return_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_action_mapping() {
        assert_eq!(Signal::Buy.to_action(), 1);
        assert_eq!(Signal::Sell.to_action(), -1);
        assert_eq!(Signal::Hold.to_action(), 0);
        assert_eq!(Signal::from_action(7), Signal::Hold);

        for signal in Signal::ACTION_SPACE {
            assert_eq!(Signal::from_index(signal.action_index()), Some(signal));
            assert_eq!(Signal::from_action(signal.to_action()), signal);
        }
        assert_eq!(Signal::from_index(3), None);
    }

    #[test]
    fn test_experience_queue_format() {
        let exp = Experience {
            state: vec![0.1, -0.25, 0.5],
            action: -1,
            reward: -0.0123,
            next_state: vec![0.2, -0.2, 0.75],
            done: false,
            quantity: 0.002,
        };

        let raw = exp.to_json().unwrap();
        let decoded = Experience::from_json(&raw).unwrap();
        assert_eq!(decoded, exp);
        assert_eq!(decoded.signal(), Signal::Sell);
    }

    #[test]
    fn test_experience_without_quantity_uses_default() {
        let raw = r#"{"state":[0.0],"action":1,"reward":0.5,"next_state":[0.1],"done":true}"#;
        let exp = Experience::from_json(raw).unwrap();
        assert_eq!(exp.quantity, crate::config::DEFAULT_TRADE_SIZE);
        assert!(exp.done);
    }

    #[test]
    fn test_signal_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Signal::Buy).unwrap(), "\"BUY\"");
        let s: Signal = serde_json::from_str("\"HOLD\"").unwrap();
        assert_eq!(s, Signal::Hold);
    }
}
