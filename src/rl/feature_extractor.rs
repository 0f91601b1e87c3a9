//! Feature Extractor for the decision engines
//!
//! Builds an 11-dimensional observation from the tick window, the indicator
//! feedback map and the portfolio context.
//!
//! Feature Layout (stable, concatenated positionally for model input):
//! [0]   price_change_pct     vs previous tick, percent             [-1, 1]
//! [1]   momentum_pct         vs tick 10 back, percent              [-1, 1]
//! [2]   band_position        within a 2σ band over last 10 ticks   [0, 1]
//! [3]   rsi_scaled           (rsi - 50) / 50                       [-1, 1]
//! [4]   macd_diff            (macd - signal) / price, percent      [-1, 1]
//! [5]   atr_pct              atr / price                           [0, 1]
//! [6]   adx_scaled           adx / 100                             [0, 1]
//! [7]   inventory_ratio      position value / portfolio value      [0, 1]
//! [8]   drawdown_pct         from peak portfolio value             [0, 1]
//! [9]   trade_duration_norm  open position age, capped at 1h       [0, 1]
//! [10]  unrealized_pnl_pct   vs entry price                        [-1, 1]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::types::Tick;

pub const FEATURE_NAMES: [&str; 11] = [
    "price_change_pct",
    "momentum_pct",
    "band_position",
    "rsi_scaled",
    "macd_diff",
    "atr_pct",
    "adx_scaled",
    "inventory_ratio",
    "drawdown_pct",
    "trade_duration_norm",
    "unrealized_pnl_pct",
];

pub const FEATURE_COUNT: usize = FEATURE_NAMES.len();

const EPS: f64 = 1e-8;
const MOMENTUM_LOOKBACK: usize = 10;
const BAND_WINDOW: usize = 10;
const MAX_TRADE_DURATION_SECS: f64 = 3600.0;

/// Ordered named feature values for one decision cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    entries: Vec<(String, f64)>,
}

impl FeatureVector {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, f64)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| *v)
    }

    /// Value or 0.0 when absent
    pub fn value(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }

    /// Model input in positional order
    pub fn values(&self) -> Vec<f32> {
        self.entries.iter().map(|(_, v)| *v as f32).collect()
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

}

impl fmt::Display for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            writeln!(f, "[{:2}] {:22} = {:.4}", i, name, value)?;
        }
        Ok(())
    }
}

/// Portfolio side of the observation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureContext {
    pub current_price: f64,
    pub inventory: f64,
    pub cash: f64,
    pub entry_price: f64,
    /// Fraction below the peak portfolio value
    pub drawdown_pct: f64,
    /// Seconds since the open position was entered (0 when flat)
    pub holding_secs: f64,
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    finite_or_zero(v).clamp(lo, hi)
}

fn pct_change(now: f64, then: f64) -> f64 {
    (now - then) / (then.abs() + EPS) * 100.0
}

/// mean ± 2σ of the last `BAND_WINDOW` ticks
fn local_band(ticks: &[Tick]) -> (f64, f64) {
    let tail = &ticks[ticks.len().saturating_sub(BAND_WINDOW)..];
    let n = tail.len() as f64;
    let mean = tail.iter().map(|t| t.price).sum::<f64>() / n;
    let std = (tail.iter().map(|t| (t.price - mean).powi(2)).sum::<f64>() / n).sqrt();
    (mean - 2.0 * std, mean + 2.0 * std)
}

/// Position of `price` inside the Bollinger band. The indicator's band is
/// used when the feedback carries one; a window too short for the indicator
/// gets the same band computed over what is there.
fn band_position(ticks: &[Tick], price: f64, feedback: &HashMap<String, f64>) -> f64 {
    let (lower, upper) = match (feedback.get("bollinger_lower"), feedback.get("bollinger_upper")) {
        (Some(lo), Some(hi)) if lo.is_finite() && hi.is_finite() => (*lo, *hi),
        _ => local_band(ticks),
    };
    let width = upper - lower;
    if width < EPS {
        return 0.5;
    }
    clamp((price - lower) / width, 0.0, 1.0)
}

/// Build the observation vector.
///
/// Pure: identical inputs always give identical output. An empty window yields
/// an empty vector, which the decision engines treat as HOLD.
pub fn build_features(
    ticks: &[Tick],
    ctx: &FeatureContext,
    feedback: &HashMap<String, f64>,
) -> FeatureVector {
    let Some(last) = ticks.last() else {
        return FeatureVector::empty();
    };

    let price = if ctx.current_price > 0.0 { ctx.current_price } else { last.price };
    let prev = if ticks.len() >= 2 { ticks[ticks.len() - 2].price } else { last.price };
    let back = if ticks.len() > MOMENTUM_LOOKBACK {
        ticks[ticks.len() - 1 - MOMENTUM_LOOKBACK].price
    } else {
        prev
    };

    let fb = |key: &str, default: f64| finite_or_zero(feedback.get(key).copied().unwrap_or(default));
    let rsi = fb("rsi", 50.0);
    let macd = fb("macd", 0.0);
    let macd_signal = fb("macd_signal", 0.0);
    let atr = fb("atr", 0.0);
    let adx = fb("adx", 20.0);

    let position_value = ctx.inventory * price;
    let portfolio_value = ctx.cash + position_value;
    let unrealized = if ctx.inventory > 0.0 && ctx.entry_price > 0.0 {
        (price - ctx.entry_price) / (ctx.entry_price + EPS)
    } else {
        0.0
    };

    let values = [
        clamp(pct_change(price, prev), -1.0, 1.0),
        clamp(pct_change(price, back), -1.0, 1.0),
        band_position(ticks, price, feedback),
        clamp((rsi - 50.0) / 50.0, -1.0, 1.0),
        clamp((macd - macd_signal) / (price + EPS) * 100.0, -1.0, 1.0),
        clamp(atr / (price + EPS), 0.0, 1.0),
        clamp(adx / 100.0, 0.0, 1.0),
        clamp(position_value / (portfolio_value.abs() + EPS), 0.0, 1.0),
        clamp(ctx.drawdown_pct, 0.0, 1.0),
        clamp(ctx.holding_secs / MAX_TRADE_DURATION_SECS, 0.0, 1.0),
        clamp(unrealized, -1.0, 1.0),
    ];

    FeatureVector {
        entries: FEATURE_NAMES
            .iter()
            .zip(values)
            .map(|(name, v)| (name.to_string(), v))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorSet;

    fn ticks(prices: &[f64]) -> Vec<Tick> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| Tick::new(*p, 0.5, i as i64 * 250))
            .collect()
    }

    fn flat_ctx(price: f64) -> FeatureContext {
        FeatureContext {
            current_price: price,
            cash: 1000.0,
            ..Default::default()
        }
    }

    fn ranges() -> [(f64, f64); FEATURE_COUNT] {
        [
            (-1.0, 1.0),
            (-1.0, 1.0),
            (0.0, 1.0),
            (-1.0, 1.0),
            (-1.0, 1.0),
            (0.0, 1.0),
            (0.0, 1.0),
            (0.0, 1.0),
            (0.0, 1.0),
            (0.0, 1.0),
            (-1.0, 1.0),
        ]
    }

    #[test]
    fn test_empty_window_gives_empty_vector() {
        let fv = build_features(&[], &flat_ctx(100.0), &HashMap::new());
        assert!(fv.is_empty());
    }

    #[test]
    fn test_stable_key_order() {
        let fv = build_features(&ticks(&[100.0, 101.0]), &flat_ctx(101.0), &HashMap::new());
        let names: Vec<&str> = fv.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, FEATURE_NAMES.to_vec());
        assert_eq!(fv.values().len(), FEATURE_COUNT);
    }

    #[test]
    fn test_single_tick_is_finite_and_neutral() {
        let fv = build_features(&ticks(&[100.0]), &flat_ctx(100.0), &HashMap::new());
        assert_eq!(fv.value("price_change_pct"), 0.0);
        assert_eq!(fv.value("momentum_pct"), 0.0);
        assert_eq!(fv.value("band_position"), 0.5);
        assert_eq!(fv.value("rsi_scaled"), 0.0);
        assert!((fv.value("adx_scaled") - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_momentum_uses_ten_back_when_available() {
        let prices: Vec<f64> = (0..12).map(|i| 100.0 + i as f64 * 0.01).collect();
        let fv = build_features(&ticks(&prices), &flat_ctx(100.11), &HashMap::new());
        // 100.11 vs 100.01 (ten back) is ~0.1%
        assert!((fv.value("momentum_pct") - 0.09999).abs() < 1e-3);
        assert!(fv.value("price_change_pct") < fv.value("momentum_pct"));
    }

    #[test]
    fn test_values_stay_in_range_under_extremes() {
        let mut feedback = HashMap::new();
        feedback.insert("rsi".to_string(), 250.0);
        feedback.insert("macd".to_string(), f64::NAN);
        feedback.insert("atr".to_string(), 1e12);
        feedback.insert("adx".to_string(), -40.0);

        let ctx = FeatureContext {
            current_price: 1e6,
            inventory: 5.0,
            cash: 0.0,
            entry_price: 1.0,
            drawdown_pct: 3.0,
            holding_secs: 1e9,
        };
        let fv = build_features(&ticks(&[1.0, 1e6, 1e-3, 1e6]), &ctx, &feedback);

        for ((name, v), (lo, hi)) in fv.entries().iter().zip(ranges()) {
            assert!(v.is_finite(), "{} not finite", name);
            assert!(*v >= lo && *v <= hi, "{} = {} outside [{}, {}]", name, v, lo, hi);
        }
    }

    #[test]
    fn test_portfolio_features() {
        let ctx = FeatureContext {
            current_price: 110.0,
            inventory: 1.0,
            cash: 110.0,
            entry_price: 100.0,
            drawdown_pct: 0.1,
            holding_secs: 1800.0,
        };
        let fv = build_features(&ticks(&[100.0, 110.0]), &ctx, &HashMap::new());
        assert!((fv.value("inventory_ratio") - 0.5).abs() < 1e-6);
        assert!((fv.value("drawdown_pct") - 0.1).abs() < 1e-12);
        assert!((fv.value("trade_duration_norm") - 0.5).abs() < 1e-12);
        assert!((fv.value("unrealized_pnl_pct") - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_build_is_pure() {
        let window = ticks(&[100.0, 100.5, 99.8, 100.2]);
        let mut feedback = HashMap::new();
        feedback.insert("rsi".to_string(), 61.0);
        let ctx = flat_ctx(100.2);
        assert_eq!(
            build_features(&window, &ctx, &feedback),
            build_features(&window, &ctx, &feedback)
        );
    }

    #[test]
    fn test_band_position_reads_bollinger_feedback() {
        let window = ticks(&[100.0; 12]);
        let mut feedback = HashMap::new();
        feedback.insert("bollinger_lower".to_string(), 90.0);
        feedback.insert("bollinger_upper".to_string(), 110.0);
        let f = build_features(&window, &flat_ctx(105.0), &feedback);
        assert!((f.value("band_position") - 0.75).abs() < 1e-9);

        // flat window without the indicator: zero-width band
        let f = build_features(&window, &flat_ctx(105.0), &HashMap::new());
        assert_eq!(f.value("band_position"), 0.5);
    }

    #[test]
    fn test_indicator_band_matches_local_band() {
        let prices: Vec<f64> = (0..30).map(|i| 100.0 + ((i * 7) % 5) as f64 * 0.3).collect();
        let window = ticks(&prices);
        let ctx = flat_ctx(*prices.last().unwrap());
        let feedback = IndicatorSet::default().feedback(&window);
        assert!(feedback.contains_key("bollinger_upper"));
        let with = build_features(&window, &ctx, &feedback).value("band_position");
        let without = build_features(&window, &ctx, &HashMap::new()).value("band_position");
        assert!((with - without).abs() < 1e-9);
    }

    #[test]
    fn test_display_lists_every_feature() {
        let f = build_features(&ticks(&[100.0, 101.0]), &flat_ctx(101.0), &HashMap::new());
        let text = f.to_string();
        assert_eq!(text.lines().count(), FEATURE_COUNT);
        assert!(text.starts_with("[ 0] price_change_pct"));
        assert!(text.contains("unrealized_pnl_pct"));
    }
}
