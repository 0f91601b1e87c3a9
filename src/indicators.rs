// src/indicators.rs
//! Technical indicators computed over the rolling tick window.
//!
//! Each indicator is opaque to its callers: it maps a window of ticks to a small
//! set of named values. A short window or a non-finite result is reported as an
//! `IndicatorError`, and [`IndicatorSet::feedback`] replaces failed outputs with
//! neutral defaults so the feature builder always sees a complete map.

use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::types::Tick;

#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("insufficient ticks: need {needed}, got {got}")]
    InsufficientTicks { needed: usize, got: usize },
    #[error("non-finite output for '{0}'")]
    NonFinite(String),
}

/// Neutral values used when an indicator cannot be computed
pub const NEUTRAL_DEFAULTS: [(&str, f64); 5] = [
    ("rsi", 50.0),
    ("adx", 20.0),
    ("atr", 0.0),
    ("macd", 0.0),
    ("macd_signal", 0.0),
];

pub trait Indicator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum number of ticks needed for a defined result
    fn window(&self) -> usize;

    fn compute(&self, ticks: &[Tick]) -> HashMap<String, f64>;

    /// Window check plus finiteness check around `compute`
    fn safe_compute(&self, ticks: &[Tick]) -> Result<HashMap<String, f64>, IndicatorError> {
        let needed = self.window();
        if ticks.len() < needed {
            return Err(IndicatorError::InsufficientTicks { needed, got: ticks.len() });
        }
        let values = self.compute(ticks);
        if let Some((key, _)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(IndicatorError::NonFinite(key.clone()));
        }
        Ok(values)
    }
}

fn prices(ticks: &[Tick]) -> Vec<f64> {
    ticks.iter().map(|t| t.price).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded with the first value
fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = match values.first() {
        Some(v) => *v,
        None => return out,
    };
    for &v in values {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

pub struct Rsi {
    pub period: usize,
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn window(&self) -> usize {
        self.period + 1
    }

    fn compute(&self, ticks: &[Tick]) -> HashMap<String, f64> {
        let p = prices(ticks);
        let tail = &p[p.len().saturating_sub(self.period + 1)..];
        let (mut gain, mut loss) = (0.0, 0.0);
        for w in tail.windows(2) {
            let delta = w[1] - w[0];
            if delta > 0.0 {
                gain += delta;
            } else {
                loss -= delta;
            }
        }
        let rsi = if gain == 0.0 && loss == 0.0 {
            50.0
        } else if loss == 0.0 {
            100.0
        } else {
            let rs = gain / loss;
            100.0 - 100.0 / (1.0 + rs)
        };
        HashMap::from([("rsi".to_string(), rsi)])
    }
}

pub struct Macd {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl Indicator for Macd {
    fn name(&self) -> &'static str {
        "macd"
    }

    fn window(&self) -> usize {
        self.slow
    }

    fn compute(&self, ticks: &[Tick]) -> HashMap<String, f64> {
        let p = prices(ticks);
        let fast = ema(&p, self.fast);
        let slow = ema(&p, self.slow);
        let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
        let signal = ema(&line, self.signal);
        HashMap::from([
            ("macd".to_string(), line.last().copied().unwrap_or(0.0)),
            ("macd_signal".to_string(), signal.last().copied().unwrap_or(0.0)),
        ])
    }
}

/// Tick-level true range is the absolute move between consecutive trades
fn true_ranges(p: &[f64]) -> Vec<f64> {
    p.windows(2).map(|w| (w[1] - w[0]).abs()).collect()
}

pub struct Atr {
    pub period: usize,
}

impl Indicator for Atr {
    fn name(&self) -> &'static str {
        "atr"
    }

    fn window(&self) -> usize {
        self.period + 1
    }

    fn compute(&self, ticks: &[Tick]) -> HashMap<String, f64> {
        let tr = true_ranges(&prices(ticks));
        let atr = mean(&tr[tr.len().saturating_sub(self.period)..]);
        HashMap::from([("atr".to_string(), atr)])
    }
}

pub struct Adx {
    pub period: usize,
}

impl Indicator for Adx {
    fn name(&self) -> &'static str {
        "adx"
    }

    /// One period to seed the directional indices, another to average DX
    fn window(&self) -> usize {
        2 * self.period
    }

    fn compute(&self, ticks: &[Tick]) -> HashMap<String, f64> {
        let p = prices(ticks);
        let tr = true_ranges(&p);
        let plus_dm: Vec<f64> = p.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect();
        let minus_dm: Vec<f64> = p.windows(2).map(|w| (w[0] - w[1]).max(0.0)).collect();

        let n = self.period;
        let mut dx = Vec::new();
        for end in n..=tr.len() {
            let atr = mean(&tr[end - n..end]);
            if atr == 0.0 {
                dx.push(0.0);
                continue;
            }
            let plus_di = 100.0 * mean(&plus_dm[end - n..end]) / atr;
            let minus_di = 100.0 * mean(&minus_dm[end - n..end]) / atr;
            let sum = plus_di + minus_di;
            dx.push(if sum == 0.0 { 0.0 } else { 100.0 * (plus_di - minus_di).abs() / sum });
        }

        let adx = mean(&dx[dx.len().saturating_sub(n)..]);
        HashMap::from([("adx".to_string(), adx)])
    }
}

pub struct Bollinger {
    pub period: usize,
    pub num_std: f64,
}

impl Indicator for Bollinger {
    fn name(&self) -> &'static str {
        "bollinger"
    }

    fn window(&self) -> usize {
        self.period
    }

    fn compute(&self, ticks: &[Tick]) -> HashMap<String, f64> {
        let p = prices(ticks);
        let tail = &p[p.len().saturating_sub(self.period)..];
        let m = mean(tail);
        let std = (tail.iter().map(|x| (x - m).powi(2)).sum::<f64>() / tail.len() as f64).sqrt();
        HashMap::from([
            ("bollinger_upper".to_string(), m + self.num_std * std),
            ("bollinger_lower".to_string(), m - self.num_std * std),
            ("bollinger_mean".to_string(), m),
        ])
    }
}

/// The indicator agents consulted every decision cycle
pub struct IndicatorSet {
    indicators: Vec<Box<dyn Indicator>>,
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self::new(vec![
            Box::new(Rsi { period: 14 }),
            Box::new(Macd { fast: 12, slow: 26, signal: 9 }),
            Box::new(Atr { period: 14 }),
            Box::new(Adx { period: 14 }),
            Box::new(Bollinger { period: 10, num_std: 2.0 }),
        ])
    }
}

impl IndicatorSet {
    pub fn new(indicators: Vec<Box<dyn Indicator>>) -> Self {
        Self { indicators }
    }

    /// Merged indicator outputs; failed indicators are skipped and the
    /// neutral defaults fill any missing key.
    pub fn feedback(&self, ticks: &[Tick]) -> HashMap<String, f64> {
        let mut out: HashMap<String, f64> = NEUTRAL_DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        for indicator in &self.indicators {
            match indicator.safe_compute(ticks) {
                Ok(values) => out.extend(values),
                Err(e) => debug!("[CYCLE] Indicator {} skipped: {}", indicator.name(), e),
            }
        }
        out
    }
}
