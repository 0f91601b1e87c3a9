//! Rolling trade-outcome statistics feeding the reward shaper.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::config::EvaluatorConfig;

/// One closed (or partially closed) trade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeSample {
    pub realized_pnl: f64,
    pub portfolio_value: f64,
    pub duration_secs: f64,
    pub volatility: f64,
    pub slippage_cost: f64,
    pub fee_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorFeedback {
    /// Multiplies shaped rewards when recent average PnL is positive
    pub reward_bonus_booster: f64,
    /// Divides shaped rewards when drawdown is high
    pub penalty_aggressiveness: f64,
    pub win_rate: f64,
    pub drawdown: f64,
    pub avg_pnl: f64,
    pub avg_duration_secs: f64,
    pub avg_slippage_cost: f64,
    pub avg_fee_cost: f64,
    pub volatility_success_rate: f64,
    pub sharpe_ratio: f64,
}

impl Default for EvaluatorFeedback {
    fn default() -> Self {
        Self {
            reward_bonus_booster: 1.0,
            penalty_aggressiveness: 1.0,
            win_rate: 0.5,
            drawdown: 0.0,
            avg_pnl: 0.0,
            avg_duration_secs: 0.0,
            avg_slippage_cost: 0.0,
            avg_fee_cost: 0.0,
            volatility_success_rate: 0.5,
            sharpe_ratio: 0.0,
        }
    }
}

pub struct EvaluatorAgent {
    short_window: usize,
    long_window: usize,
    high_volatility: f64,
    trades: VecDeque<TradeSample>,
}

fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

impl EvaluatorAgent {
    pub fn new(config: &EvaluatorConfig) -> Self {
        Self {
            short_window: config.short_window,
            long_window: config.long_window,
            high_volatility: config.high_volatility,
            trades: VecDeque::with_capacity(config.long_window),
        }
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn record_trade(&mut self, sample: TradeSample) {
        if self.trades.len() >= self.long_window {
            self.trades.pop_front();
        }
        self.trades.push_back(sample);
    }

    fn recent(&self) -> impl Iterator<Item = &TradeSample> {
        self.trades.iter().skip(self.trades.len().saturating_sub(self.short_window))
    }

    pub fn generate_feedback(&self) -> EvaluatorFeedback {
        if self.trades.len() < 2 {
            return EvaluatorFeedback::default();
        }

        let recent: Vec<&TradeSample> = self.recent().collect();
        let n = recent.len() as f64;
        let win_rate = recent.iter().filter(|t| t.realized_pnl > 0.0).count() as f64 / n;
        let avg_pnl = mean(recent.iter().map(|t| &t.realized_pnl));

        let max_value = self
            .trades
            .iter()
            .map(|t| t.portfolio_value)
            .fold(f64::MIN, f64::max);
        let current = self.trades.back().map(|t| t.portfolio_value).unwrap_or(max_value);
        let drawdown = ((max_value - current) / max_value.max(1e-8)).max(0.0);

        let feedback = EvaluatorFeedback {
            reward_bonus_booster: 1.0 + avg_pnl.max(0.0).min(0.01) * 10.0,
            penalty_aggressiveness: 1.0 + drawdown * 5.0,
            win_rate,
            drawdown,
            avg_pnl,
            avg_duration_secs: mean(recent.iter().map(|t| &t.duration_secs)),
            avg_slippage_cost: mean(recent.iter().map(|t| &t.slippage_cost)),
            avg_fee_cost: mean(recent.iter().map(|t| &t.fee_cost)),
            volatility_success_rate: self.volatility_success(&recent),
            sharpe_ratio: self.sharpe_ratio(),
        };
        debug!("[REWARD] Evaluator feedback: {:?}", feedback);
        feedback
    }

    /// Win rate among recent trades taken in high volatility; 0.5 when none
    fn volatility_success(&self, recent: &[&TradeSample]) -> f64 {
        let volatile: Vec<&&TradeSample> =
            recent.iter().filter(|t| t.volatility > self.high_volatility).collect();
        if volatile.is_empty() {
            return 0.5;
        }
        volatile.iter().filter(|t| t.realized_pnl > 0.0).count() as f64 / volatile.len() as f64
    }

    /// Annualized (√252) mean over std of portfolio value returns
    fn sharpe_ratio(&self) -> f64 {
        let values: Vec<f64> = self.trades.iter().map(|t| t.portfolio_value).collect();
        let returns: Vec<f64> = values
            .windows(2)
            .map(|w| (w[1] - w[0]) / w[0].max(1e-8))
            .collect();
        if returns.is_empty() {
            return 0.0;
        }
        let m = mean(returns.iter());
        let std = (returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / returns.len() as f64).sqrt();
        if std == 0.0 {
            return 0.0;
        }
        m / std * 252f64.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(short: usize, long: usize) -> EvaluatorAgent {
        EvaluatorAgent::new(&EvaluatorConfig {
            short_window: short,
            long_window: long,
            high_volatility: 0.002,
        })
    }

    fn trade(pnl: f64, value: f64, vol: f64) -> TradeSample {
        TradeSample {
            realized_pnl: pnl,
            portfolio_value: value,
            duration_secs: 30.0,
            volatility: vol,
            slippage_cost: 0.01,
            fee_cost: 0.02,
        }
    }

    #[test]
    fn test_neutral_with_fewer_than_two_trades() {
        let mut ev = agent(10, 100);
        assert_eq!(ev.generate_feedback(), EvaluatorFeedback::default());
        ev.record_trade(trade(1.0, 1001.0, 0.0));
        assert_eq!(ev.generate_feedback(), EvaluatorFeedback::default());
    }

    #[test]
    fn test_booster_is_capped() {
        let mut ev = agent(10, 100);
        ev.record_trade(trade(5.0, 1005.0, 0.0));
        ev.record_trade(trade(7.0, 1012.0, 0.0));
        let fb = ev.generate_feedback();
        assert!((fb.reward_bonus_booster - 1.1).abs() < 1e-12);
        assert_eq!(fb.penalty_aggressiveness, 1.0);
        assert_eq!(fb.win_rate, 1.0);
    }

    #[test]
    fn test_drawdown_raises_aggressiveness() {
        let mut ev = agent(10, 100);
        ev.record_trade(trade(-1.0, 1000.0, 0.0));
        ev.record_trade(trade(-100.0, 900.0, 0.0));
        let fb = ev.generate_feedback();
        assert!((fb.drawdown - 0.1).abs() < 1e-12);
        assert!((fb.penalty_aggressiveness - 1.5).abs() < 1e-12);
        assert_eq!(fb.reward_bonus_booster, 1.0);
        assert_eq!(fb.win_rate, 0.0);
        assert!(fb.sharpe_ratio == 0.0);
    }

    #[test]
    fn test_buffers_bounded_by_long_window() {
        let mut ev = agent(2, 3);
        for i in 0..10 {
            ev.record_trade(trade(i as f64, 1000.0 + i as f64, 0.0));
        }
        assert_eq!(ev.len(), 3);
        let fb = ev.generate_feedback();
        // short window sees the last two trades only
        assert!((fb.avg_pnl - 8.5).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_success_and_sharpe() {
        let mut ev = agent(10, 100);
        ev.record_trade(trade(1.0, 1000.0, 0.01));
        ev.record_trade(trade(-1.0, 1010.0, 0.01));
        ev.record_trade(trade(1.0, 1015.0, 0.0));
        ev.record_trade(trade(1.0, 1030.0, 0.0));
        let fb = ev.generate_feedback();
        assert!((fb.volatility_success_rate - 0.5).abs() < 1e-12);
        assert!(fb.sharpe_ratio > 0.0);
        assert!((fb.avg_fee_cost - 0.02).abs() < 1e-12);
    }
}
