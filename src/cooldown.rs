// src/cooldown.rs
//! Minimum spacing between accepted trades.

use tracing::debug;

use crate::config::CooldownConfig;
use crate::types::Signal;

/// Debounce gate; an overridden signal is discarded, never deferred
#[derive(Debug, Clone)]
pub struct CooldownGate {
    enabled: bool,
    cooldown_ms: i64,
    last_trade: Option<i64>,
}

impl CooldownGate {
    pub fn new(config: &CooldownConfig) -> Self {
        Self {
            enabled: config.enabled,
            cooldown_ms: (config.cooldown_secs * 1000.0).round() as i64,
            last_trade: None,
        }
    }

    pub fn can_trade(&self, now_ms: i64) -> bool {
        if !self.enabled {
            return true;
        }
        match self.last_trade {
            Some(last) => now_ms - last >= self.cooldown_ms,
            None => true,
        }
    }

    pub fn record_trade(&mut self, now_ms: i64) {
        self.last_trade = Some(now_ms);
    }

    pub fn last_trade(&self) -> Option<i64> {
        self.last_trade
    }

    /// Pass the signal through, or force HOLD while cooling down.
    ///
    /// HOLD always passes and never touches the last-trade timestamp. The caller
    /// records the trade once the portfolio actually executes it.
    pub fn gate(&self, signal: Signal, now_ms: i64) -> (Signal, bool) {
        if !signal.is_trade() || self.can_trade(now_ms) {
            return (signal, false);
        }
        debug!(
            "[CYCLE] Cooldown active ({} ms since last trade), {} -> HOLD",
            now_ms - self.last_trade.unwrap_or(now_ms),
            signal
        );
        (Signal::Hold, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(secs: f64) -> CooldownGate {
        CooldownGate::new(&CooldownConfig { enabled: true, cooldown_secs: secs })
    }

    #[test]
    fn test_cooldown_scenario() {
        let mut g = gate(3.0);
        g.record_trade(1_000);
        assert!(!g.can_trade(2_000));
        assert!(g.can_trade(4_500));
    }

    #[test]
    fn test_first_trade_always_allowed() {
        assert!(gate(3.0).can_trade(0));
    }

    #[test]
    fn test_gate_overrides_trade_but_not_hold() {
        let mut g = gate(3.0);
        g.record_trade(1_000);
        assert_eq!(g.gate(Signal::Buy, 2_000), (Signal::Hold, true));
        assert_eq!(g.gate(Signal::Hold, 2_000), (Signal::Hold, false));
        assert_eq!(g.gate(Signal::Sell, 4_000), (Signal::Sell, false));
        assert_eq!(g.last_trade(), Some(1_000));
    }

    #[test]
    fn test_disabled_gate_passes_everything() {
        let mut g = CooldownGate::new(&CooldownConfig { enabled: false, cooldown_secs: 60.0 });
        g.record_trade(1_000);
        assert!(g.can_trade(1_001));
    }
}
