//! Reward shaping for the DQN experiences
//!
//! The reward for a cycle is computed once the next cycle has observed the
//! price, so the movement term is the real move between the two decisions:
//!
//! 1. move% net of fee + slippage, signed by the action (BUY gains on a rise,
//!    SELL on a fall); HOLD pays a small inactivity penalty
//! 2. big-move detection against a volatility-adaptive threshold: HOLD during a
//!    big move is penalized further, a profitable trade is bonus-multiplied
//! 3. drawdown penalty on an open losing position
//! 4. inventory penalty once the position exceeds the configured share of the
//!    portfolio
//! 5. exploration bonus for trades, then the evaluator's booster / aggressiveness
//! 6. nonlinear reshape: the part of a positive reward above 1 is compressed
//!    to 1 + (x - 1)^p (p < 1), so a win is never scaled up; negative × k (k > 1)

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::evaluator::EvaluatorFeedback;
use crate::config::RewardConfig;
use crate::types::{Signal, Tick};

/// Standard deviation of tick-to-tick returns over the last `window` ticks
pub fn tick_volatility(ticks: &[Tick], window: usize) -> f64 {
    let tail = &ticks[ticks.len().saturating_sub(window + 1)..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0].price > 0.0)
        .map(|w| (w[1].price - w[0].price) / w[0].price)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    var.sqrt()
}

/// Sub-linear above 1 for gains, linear amplification for losses.
/// `reshape(x) <= x` for every `x > 0`.
fn reshape(scaled: f64, positive_power: f64, negative_multiplier: f64) -> f64 {
    let reward = if scaled > 1.0 {
        1.0 + (scaled - 1.0).powf(positive_power)
    } else if scaled > 0.0 {
        scaled
    } else {
        scaled * negative_multiplier
    };
    if reward.is_finite() {
        reward
    } else {
        0.0
    }
}

/// What happened between a decision and the next observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardInput {
    /// Action actually applied (a rejected trade counts as HOLD)
    pub signal: Signal,
    pub decision_price: f64,
    pub next_price: f64,
    pub inventory: f64,
    pub entry_price: f64,
    pub inventory_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub move_pct: f64,
    pub threshold_pct: f64,
    pub big_move: bool,
    pub base: f64,
    pub drawdown_penalty: f64,
    pub inventory_penalty: f64,
    pub exploration_bonus: f64,
    pub booster: f64,
    pub aggressiveness: f64,
    /// Reward before the nonlinear reshape
    pub scaled: f64,
    pub reward: f64,
}

pub struct RewardShaper {
    config: RewardConfig,
    /// fee + slippage, as a fraction
    cost_rate: f64,
}

impl RewardShaper {
    pub fn new(config: &RewardConfig, fee_rate: f64, slippage_rate: f64) -> Self {
        Self {
            config: config.clone(),
            cost_rate: fee_rate + slippage_rate,
        }
    }

    /// Big-move threshold as a fraction of price
    pub fn move_threshold(&self, ticks: &[Tick]) -> f64 {
        if !self.config.use_dynamic_volatility {
            return self.config.fixed_move_threshold;
        }
        let vol = tick_volatility(ticks, self.config.volatility_window);
        (vol * self.config.volatility_multiplier)
            .clamp(self.config.min_move_threshold, self.config.max_move_threshold)
    }

    pub fn compute(
        &self,
        input: &RewardInput,
        ticks: &[Tick],
        feedback: &EvaluatorFeedback,
    ) -> RewardBreakdown {
        let c = &self.config;
        let movement = if input.decision_price > 0.0 {
            (input.next_price - input.decision_price) / input.decision_price
        } else {
            0.0
        };
        let threshold = self.move_threshold(ticks);
        let big_move = movement.abs() > threshold;
        let move_pct = movement * 100.0;
        let cost_pct = self.cost_rate * 100.0;

        let mut base = match input.signal {
            Signal::Buy => move_pct - cost_pct,
            Signal::Sell => -move_pct - cost_pct,
            Signal::Hold => {
                let mut penalty = c.hold_penalty;
                if big_move {
                    penalty += c.big_move_hold_penalty + move_pct.abs();
                }
                -penalty
            }
        };
        if input.signal.is_trade() && big_move && base > 0.0 {
            base *= c.big_move_bonus;
        }

        let drawdown_penalty = if input.inventory > 0.0
            && input.entry_price > 0.0
            && input.next_price < input.entry_price
        {
            c.drawdown_weight * (input.entry_price - input.next_price) / input.entry_price * 100.0
        } else {
            0.0
        };

        let inventory_penalty = if input.inventory_ratio > c.inventory_limit {
            c.inventory_penalty_weight * (input.inventory_ratio - c.inventory_limit)
        } else {
            0.0
        };

        let exploration_bonus = if input.signal.is_trade() { c.exploration_bonus } else { 0.0 };

        let booster = feedback.reward_bonus_booster;
        let aggressiveness = feedback.penalty_aggressiveness.max(1e-8);
        let scaled =
            (base - drawdown_penalty - inventory_penalty + exploration_bonus) * booster / aggressiveness;

        let reward = reshape(scaled, c.positive_power, c.negative_multiplier);

        let breakdown = RewardBreakdown {
            move_pct,
            threshold_pct: threshold * 100.0,
            big_move,
            base,
            drawdown_penalty,
            inventory_penalty,
            exploration_bonus,
            booster,
            aggressiveness,
            scaled,
            reward,
        };
        debug!(
            "[REWARD] {} move={:+.4}% thr={:.4}% big={} base={:+.5} reward={:+.5}",
            input.signal, move_pct, breakdown.threshold_pct, big_move, base, reward
        );
        breakdown
    }
}
