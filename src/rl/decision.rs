//! Decision engines
//!
//! Both strategies implement [`DecisionEngine`]; which one runs is fixed when
//! the pipeline is built. Neither ever fails outward: every problem turns into
//! a HOLD with a reason string.

use thiserror::Error;
use tracing::{debug, warn};

use super::feature_extractor::{FeatureVector, FEATURE_COUNT};
use super::model_loader::{argmax, ModelLoader};
use crate::config::{AppConfig, DecisionConfig, ModelConfig, StrategyKind};
use crate::types::Signal;

#[derive(Debug, Error, PartialEq)]
pub enum InferenceError {
    #[error("no model loaded")]
    NoModel,
    #[error("shape mismatch: model expects {expected} inputs, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("non-finite model output")]
    NonFinite,
    #[error("invalid action index {0}")]
    InvalidAction(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResult {
    pub signal: Signal,
    /// Individual voter outputs (ensemble) or the chosen action (policy)
    pub votes: Vec<Signal>,
    pub quantity: f64,
    pub take_profit_pct: f64,
    pub reason: String,
    /// True when the signal is a default rather than a decision
    pub forced: bool,
}

pub trait DecisionEngine: Send {
    fn name(&self) -> &'static str;

    fn decide(&mut self, features: &FeatureVector) -> DecisionResult;

    /// Called once per cycle before `decide`
    fn refresh(&mut self) {}

    fn model_version(&self) -> String;
}

fn forced_hold(config: &DecisionConfig, votes: Vec<Signal>, reason: String) -> DecisionResult {
    DecisionResult {
        signal: Signal::Hold,
        votes,
        quantity: config.trade_size,
        take_profit_pct: config.take_profit_pct,
        reason,
        forced: true,
    }
}

// ============================================================================
// Rule ensemble
// ============================================================================

/// One threshold rule over the feature vector
pub type Voter = fn(&FeatureVector, &DecisionConfig) -> Signal;

fn sign_vote(v: f64) -> Signal {
    if v > 0.0 {
        Signal::Buy
    } else if v < 0.0 {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

fn rsi_vote(f: &FeatureVector, c: &DecisionConfig) -> Signal {
    let rsi = 50.0 + 50.0 * f.value("rsi_scaled");
    if rsi < c.rsi_oversold {
        Signal::Buy
    } else if rsi > c.rsi_overbought {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

fn macd_vote(f: &FeatureVector, _: &DecisionConfig) -> Signal {
    sign_vote(f.value("macd_diff"))
}

/// Trend strength gates a momentum-following vote
fn adx_vote(f: &FeatureVector, c: &DecisionConfig) -> Signal {
    if f.value("adx_scaled") * 100.0 > c.adx_trend {
        sign_vote(f.value("momentum_pct"))
    } else {
        Signal::Hold
    }
}

/// Active volatility gates a vote in the direction of the last move
fn atr_vote(f: &FeatureVector, c: &DecisionConfig) -> Signal {
    if f.value("atr_pct") > c.atr_active_pct {
        sign_vote(f.value("price_change_pct"))
    } else {
        Signal::Hold
    }
}

fn bollinger_vote(f: &FeatureVector, c: &DecisionConfig) -> Signal {
    let pos = f.value("band_position");
    if pos < c.band_low {
        Signal::Buy
    } else if pos > c.band_high {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

pub struct RuleEnsemble {
    config: DecisionConfig,
    voters: Vec<(&'static str, Voter)>,
}

impl RuleEnsemble {
    pub fn new(config: &DecisionConfig) -> Self {
        Self {
            config: config.clone(),
            voters: vec![
                ("RSI", rsi_vote as Voter),
                ("MACD", macd_vote),
                ("ADX", adx_vote),
                ("ATR", atr_vote),
                ("Bollinger", bollinger_vote),
            ],
        }
    }
}

/// Strict majority (more than half of all votes) or None
pub fn majority(votes: &[Signal]) -> Option<Signal> {
    Signal::ACTION_SPACE
        .into_iter()
        .find(|s| votes.iter().filter(|v| *v == s).count() * 2 > votes.len())
}

impl DecisionEngine for RuleEnsemble {
    fn name(&self) -> &'static str {
        "ensemble"
    }

    fn decide(&mut self, features: &FeatureVector) -> DecisionResult {
        if features.is_empty() {
            return forced_hold(&self.config, Vec::new(), "No features: HOLD".to_string());
        }

        let votes: Vec<Signal> = self.voters.iter().map(|(_, v)| v(features, &self.config)).collect();
        let tally = self
            .voters
            .iter()
            .zip(&votes)
            .map(|((name, _), s)| format!("{}={}", name, s))
            .collect::<Vec<_>>()
            .join(" ");

        match majority(&votes) {
            Some(signal) => DecisionResult {
                signal,
                votes,
                quantity: self.config.trade_size,
                take_profit_pct: self.config.take_profit_pct,
                reason: format!("Majority {} ({})", signal, tally),
                forced: false,
            },
            None => forced_hold(&self.config, votes, format!("No majority: HOLD ({})", tally)),
        }
    }

    fn model_version(&self) -> String {
        "rules".to_string()
    }
}

// ============================================================================
// Learned policy
// ============================================================================

/// Greedy policy over the value network's outputs
pub struct LearnedPolicy {
    config: DecisionConfig,
    loader: ModelLoader,
}

impl LearnedPolicy {
    pub fn new(config: &DecisionConfig, model: &ModelConfig) -> Self {
        let mut loader = ModelLoader::new(model, Some(FEATURE_COUNT + 1));
        loader.try_load();
        Self { config: config.clone(), loader }
    }

    /// Model input for a feature vector; a vector exactly one short of the
    /// model's width gets the trade size appended.
    fn model_input(&self, features: &FeatureVector, expected: usize) -> Result<Vec<f32>, InferenceError> {
        let mut input = features.values();
        if input.len() + 1 == expected {
            input.push(self.config.trade_size as f32);
        }
        if input.len() != expected {
            return Err(InferenceError::ShapeMismatch { expected, got: input.len() });
        }
        Ok(input)
    }

    pub fn infer(&self, features: &FeatureVector) -> Result<(Signal, Vec<f32>), InferenceError> {
        let model = self.loader.model().ok_or(InferenceError::NoModel)?;
        let input = self.model_input(features, model.input_dim())?;
        let q = model.forward(&input);
        if q.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinite);
        }
        let idx = argmax(&q).ok_or(InferenceError::NonFinite)?;
        let signal = Signal::from_index(idx).ok_or(InferenceError::InvalidAction(idx))?;
        Ok((signal, q))
    }
}

impl DecisionEngine for LearnedPolicy {
    fn name(&self) -> &'static str {
        "learned"
    }

    fn decide(&mut self, features: &FeatureVector) -> DecisionResult {
        match self.infer(features) {
            Ok((signal, q)) => {
                debug!("[CYCLE] Q-values {:?} -> {}", q, signal);
                DecisionResult {
                    signal,
                    votes: vec![signal],
                    quantity: self.config.trade_size,
                    take_profit_pct: self.config.take_profit_pct,
                    reason: format!(
                        "Q-argmax {} (q={})",
                        signal,
                        q.iter().map(|v| format!("{:.4}", v)).collect::<Vec<_>>().join("/")
                    ),
                    forced: false,
                }
            }
            Err(e) => {
                if e != InferenceError::NoModel {
                    warn!("[CYCLE] Inference failed: {}", e);
                }
                forced_hold(&self.config, vec![Signal::Hold], format!("Fallback: HOLD ({})", e))
            }
        }
    }

    fn refresh(&mut self) {
        self.loader.maybe_refresh();
    }

    fn model_version(&self) -> String {
        self.loader.version()
    }
}

/// Construct the configured strategy
pub fn build_engine(config: &AppConfig) -> Box<dyn DecisionEngine> {
    match config.decision.strategy {
        StrategyKind::Ensemble => Box::new(RuleEnsemble::new(&config.decision)),
        StrategyKind::Learned => Box::new(LearnedPolicy::new(&config.decision, &config.model)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::feature_extractor::{build_features, FeatureContext};
    use crate::rl::q_network::{test_layers, write_checkpoint};
    use crate::types::Tick;
    use std::collections::HashMap;

    fn features(feedback: &[(&str, f64)], prices: &[f64]) -> FeatureVector {
        let ticks: Vec<Tick> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| Tick::new(*p, 1.0, i as i64))
            .collect();
        let fb: HashMap<String, f64> = feedback.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let ctx = FeatureContext {
            current_price: *prices.last().unwrap(),
            cash: 1000.0,
            ..Default::default()
        };
        build_features(&ticks, &ctx, &fb)
    }

    fn model_config(path: std::path::PathBuf) -> ModelConfig {
        ModelConfig {
            path,
            hidden_layers: vec![8],
            refresh_interval_secs: 0,
        }
    }

    #[test]
    fn test_majority_requires_more_than_half() {
        use Signal::*;
        assert_eq!(majority(&[Buy, Buy, Buy, Sell, Hold]), Some(Buy));
        assert_eq!(majority(&[Buy, Buy, Sell, Sell, Hold]), None);
        assert_eq!(majority(&[Sell, Sell]), Some(Sell));
        assert_eq!(majority(&[Buy, Sell]), None);
        assert_eq!(majority(&[]), None);
    }

    #[test]
    fn test_ensemble_buys_on_oversold_dip() {
        let mut engine = RuleEnsemble::new(&DecisionConfig::default());
        let mut prices = vec![100.0; 10];
        prices.push(90.0);

        // RSI and Bollinger vote BUY, ATR and ADX abstain, MACD flat -> HOLD majority
        let f = features(&[("rsi", 10.0), ("adx", 10.0)], &prices);
        let result = engine.decide(&f);
        assert_eq!(result.votes.len(), 5);
        assert_eq!(result.signal, Signal::Hold);
        assert!(!result.forced);

        let f = features(&[("rsi", 10.0), ("macd", 1.0), ("macd_signal", 0.0), ("adx", 10.0)], &prices);
        let result = engine.decide(&f);
        assert_eq!(result.signal, Signal::Buy);
        assert!(result.reason.starts_with("Majority BUY"));
    }

    #[test]
    fn test_ensemble_majority_sell() {
        let mut engine = RuleEnsemble::new(&DecisionConfig::default());
        let mut prices = vec![100.0; 10];
        prices.push(110.0);
        let f = features(
            &[("rsi", 90.0), ("macd", 2.0), ("macd_signal", 0.0), ("adx", 10.0)],
            &prices,
        );
        let result = engine.decide(&f);
        // RSI SELL, Bollinger SELL, MACD BUY, ADX/ATR HOLD -> no majority
        assert_eq!(result.signal, Signal::Hold);
        assert!(result.forced);
        assert!(result.reason.starts_with("No majority"));

        let f = features(
            &[("rsi", 90.0), ("macd", -2.0), ("macd_signal", 0.0), ("adx", 10.0)],
            &prices,
        );
        let result = engine.decide(&f);
        assert_eq!(result.signal, Signal::Sell);
        assert!(!result.forced);
    }

    #[test]
    fn test_empty_features_hold() {
        let mut engine = RuleEnsemble::new(&DecisionConfig::default());
        let result = engine.decide(&FeatureVector::empty());
        assert_eq!(result.signal, Signal::Hold);
        assert!(result.forced);
    }

    #[test]
    fn test_policy_without_model_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = LearnedPolicy::new(
            &DecisionConfig::default(),
            &model_config(dir.path().join("missing.safetensors")),
        );
        let result = policy.decide(&features(&[], &[100.0, 101.0]));
        assert_eq!(result.signal, Signal::Hold);
        assert!(result.forced);
        assert_eq!(result.reason, "Fallback: HOLD (no model loaded)");
        assert_eq!(policy.model_version(), "fallback");
    }

    #[cfg(not(feature = "rl"))]
    #[test]
    fn test_policy_without_backend_holds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[FEATURE_COUNT + 1, 8, 3], 5)).unwrap();

        let mut policy = LearnedPolicy::new(&DecisionConfig::default(), &model_config(path));
        let result = policy.decide(&features(&[], &[100.0, 101.0]));
        assert_eq!(result.signal, Signal::Hold);
        assert!(result.forced);
        assert_eq!(policy.model_version(), "fallback");
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_policy_pads_trade_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[FEATURE_COUNT + 1, 8, 3], 5)).unwrap();

        let mut policy = LearnedPolicy::new(&DecisionConfig::default(), &model_config(path));
        let f = features(&[], &[100.0, 101.0]);
        assert_eq!(f.len(), FEATURE_COUNT);

        let (signal, q) = policy.infer(&f).unwrap();
        assert_eq!(q.len(), 3);
        let result = policy.decide(&f);
        assert_eq!(result.signal, signal);
        assert!(!result.forced);
        assert_eq!(policy.model_version().len(), 64);
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_policy_shape_mismatch_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[FEATURE_COUNT + 1, 8, 3], 5)).unwrap();
        let policy = LearnedPolicy::new(&DecisionConfig::default(), &model_config(path));

        let short = features(&[], &[100.0]);
        let truncated = FeatureVector::from_entries(short.entries()[..5].to_vec());
        assert_eq!(
            policy.infer(&truncated).unwrap_err(),
            InferenceError::ShapeMismatch { expected: FEATURE_COUNT + 1, got: 5 }
        );
    }
}
