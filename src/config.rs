// src/config.rs
//! Typed configuration for every pipeline component.
//!
//! Resolution order: defaults → optional JSON file → `NEUROTRADE_*` environment
//! variables → CLI flags (applied by the binaries). Each component only receives
//! its own section at construction time.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Trade size used when a decision does not provide its own
pub const DEFAULT_TRADE_SIZE: f64 = 0.001;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub symbol: String,
    pub tick_source: TickSourceConfig,
    pub portfolio: PortfolioConfig,
    pub cooldown: CooldownConfig,
    pub evaluator: EvaluatorConfig,
    pub reward: RewardConfig,
    pub decision: DecisionConfig,
    pub model: ModelConfig,
    pub trainer: TrainerConfig,
    pub queue: QueueConfig,
    pub summary: SummaryConfig,
    /// Milliseconds between decision cycles
    pub cycle_interval_ms: u64,
    /// Minimum ticks in the window before a cycle runs
    pub min_ticks: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbol: "btcusdt".to_string(),
            tick_source: TickSourceConfig::default(),
            portfolio: PortfolioConfig::default(),
            cooldown: CooldownConfig::default(),
            evaluator: EvaluatorConfig::default(),
            reward: RewardConfig::default(),
            decision: DecisionConfig::default(),
            model: ModelConfig::default(),
            trainer: TrainerConfig::default(),
            queue: QueueConfig::default(),
            summary: SummaryConfig::default(),
            cycle_interval_ms: 500,
            min_ticks: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickSourceConfig {
    /// Websocket URL; `{symbol}` is substituted
    pub url: String,
    pub max_ticks: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for TickSourceConfig {
    fn default() -> Self {
        Self {
            url: "wss://stream.binance.com:9443/ws/{symbol}@trade".to_string(),
            max_ticks: 100,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl TickSourceConfig {
    pub fn stream_url(&self, symbol: &str) -> String {
        self.url.replace("{symbol}", &symbol.to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub initial_cash: f64,
    pub trade_fee_rate: f64,
    pub slippage_rate: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            initial_cash: 1000.0,
            trade_fee_rate: 0.001,
            slippage_rate: 0.0005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub enabled: bool,
    pub cooldown_secs: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { enabled: true, cooldown_secs: 3.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub short_window: usize,
    pub long_window: usize,
    /// Volatility above which a trade counts towards the volatility success rate
    pub high_volatility: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { short_window: 10, long_window: 100, high_volatility: 0.002 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub use_dynamic_volatility: bool,
    /// Big-move threshold (fraction of price) when volatility is not dynamic
    pub fixed_move_threshold: f64,
    /// Multiplier on the rolling return std-dev
    pub volatility_multiplier: f64,
    pub min_move_threshold: f64,
    pub max_move_threshold: f64,
    /// Number of recent prices used for the rolling std-dev
    pub volatility_window: usize,
    pub hold_penalty: f64,
    pub big_move_hold_penalty: f64,
    pub big_move_bonus: f64,
    pub drawdown_weight: f64,
    pub inventory_limit: f64,
    pub inventory_penalty_weight: f64,
    pub exploration_bonus: f64,
    pub positive_power: f64,
    pub negative_multiplier: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            use_dynamic_volatility: true,
            fixed_move_threshold: 0.002,
            volatility_multiplier: 2.0,
            min_move_threshold: 0.0005,
            max_move_threshold: 0.01,
            volatility_window: 15,
            hold_penalty: 0.001,
            big_move_hold_penalty: 0.05,
            big_move_bonus: 1.5,
            drawdown_weight: 0.5,
            inventory_limit: 0.6,
            inventory_penalty_weight: 1.0,
            exploration_bonus: 0.001,
            positive_power: 0.8,
            negative_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Ensemble,
    Learned,
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ensemble" | "rules" => Ok(StrategyKind::Ensemble),
            "learned" | "dqn" | "model" => Ok(StrategyKind::Learned),
            other => bail!("unknown strategy '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub strategy: StrategyKind,
    pub trade_size: f64,
    pub take_profit_pct: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub adx_trend: f64,
    pub atr_active_pct: f64,
    pub band_low: f64,
    pub band_high: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Learned,
            trade_size: DEFAULT_TRADE_SIZE,
            take_profit_pct: 0.01,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            adx_trend: 25.0,
            atr_active_pct: 0.0005,
            band_low: 0.05,
            band_high: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub hidden_layers: Vec<usize>,
    pub refresh_interval_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/model.safetensors"),
            hidden_layers: vec![64, 64],
            refresh_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub replay_capacity: usize,
    pub batch_size: usize,
    pub train_after: usize,
    pub train_steps_per_experience: usize,
    pub gamma: f32,
    pub learning_rate: f32,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub target_sync_interval: u64,
    pub save_interval: u64,
    pub idle_sleep_ms: u64,
    pub log_interval: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 10_000,
            batch_size: 64,
            train_after: 500,
            train_steps_per_experience: 3,
            gamma: 0.99,
            learning_rate: 1e-3,
            epsilon_start: 1.0,
            epsilon_min: 0.05,
            epsilon_decay: 0.995,
            target_sync_interval: 1000,
            save_interval: 500,
            idle_sleep_ms: 100,
            log_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub experience_key: String,
    /// `{symbol}` is substituted
    pub signal_key: String,
    pub summary_key: String,
    pub max_signal_history: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("neurotrade.db"),
            experience_key: "experience_queue".to_string(),
            signal_key: "signal_history:{symbol}".to_string(),
            summary_key: "trading:summary".to_string(),
            max_signal_history: 1000,
        }
    }
}

impl QueueConfig {
    pub fn signal_key_for(&self, symbol: &str) -> String {
        self.signal_key.replace("{symbol}", &symbol.to_uppercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub publish_interval_ms: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self { publish_interval_ms: 1000 }
    }
}

impl AppConfig {
    /// Defaults, then the optional JSON file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => AppConfig::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("NEUROTRADE_SYMBOL") {
            self.symbol = v;
        }
        if let Ok(v) = std::env::var("NEUROTRADE_STREAM_URL") {
            self.tick_source.url = v;
        }
        if let Ok(v) = std::env::var("NEUROTRADE_DB_PATH") {
            self.queue.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NEUROTRADE_MODEL_PATH") {
            self.model.path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<StrategyKind>("NEUROTRADE_STRATEGY")? {
            self.decision.strategy = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_TRADE_FEE_RATE")? {
            self.portfolio.trade_fee_rate = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_SLIPPAGE_RATE")? {
            self.portfolio.slippage_rate = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_INITIAL_CASH")? {
            self.portfolio.initial_cash = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_COOLDOWN_SECS")? {
            self.cooldown.cooldown_secs = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_SHORT_WINDOW")? {
            self.evaluator.short_window = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_LONG_WINDOW")? {
            self.evaluator.long_window = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_REPLAY_CAPACITY")? {
            self.trainer.replay_capacity = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_BATCH_SIZE")? {
            self.trainer.batch_size = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_TRAIN_AFTER")? {
            self.trainer.train_after = v;
        }
        if let Some(v) = env_parse("NEUROTRADE_MODEL_REFRESH_SECS")? {
            self.model.refresh_interval_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol must not be empty");
        }
        if self.tick_source.max_ticks == 0 {
            bail!("tick_source.max_ticks must be positive");
        }
        if self.tick_source.backoff_initial_ms == 0
            || self.tick_source.backoff_max_ms < self.tick_source.backoff_initial_ms
        {
            bail!("tick_source backoff must satisfy 0 < initial <= max");
        }
        if self.portfolio.initial_cash < 0.0 {
            bail!("portfolio.initial_cash must be non-negative");
        }
        for (name, rate) in [
            ("trade_fee_rate", self.portfolio.trade_fee_rate),
            ("slippage_rate", self.portfolio.slippage_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                bail!("portfolio.{} must be in [0, 1), got {}", name, rate);
            }
        }
        if self.cooldown.cooldown_secs < 0.0 {
            bail!("cooldown.cooldown_secs must be non-negative");
        }
        if self.evaluator.short_window == 0 || self.evaluator.long_window < self.evaluator.short_window {
            bail!("evaluator windows must satisfy 0 < short <= long");
        }
        if self.reward.positive_power <= 0.0 || self.reward.positive_power >= 1.0 {
            bail!("reward.positive_power must be in (0, 1)");
        }
        if self.reward.negative_multiplier <= 1.0 {
            bail!("reward.negative_multiplier must be greater than 1");
        }
        if self.reward.min_move_threshold > self.reward.max_move_threshold {
            bail!("reward move threshold band is inverted");
        }
        if self.decision.trade_size <= 0.0 {
            bail!("decision.trade_size must be positive");
        }
        if self.model.hidden_layers.is_empty() || self.model.hidden_layers.contains(&0) {
            bail!("model.hidden_layers must be non-empty with positive widths");
        }
        let t = &self.trainer;
        if t.replay_capacity == 0 || t.batch_size == 0 {
            bail!("trainer.replay_capacity and trainer.batch_size must be positive");
        }
        if t.batch_size > t.replay_capacity {
            bail!("trainer.batch_size ({}) exceeds replay_capacity ({})", t.batch_size, t.replay_capacity);
        }
        if !(0.0..=1.0).contains(&t.gamma) {
            bail!("trainer.gamma must be in [0, 1]");
        }
        if t.target_sync_interval == 0 || t.save_interval == 0 {
            bail!("trainer intervals must be positive");
        }
        if self.queue.max_signal_history == 0 {
            bail!("queue.max_signal_history must be positive");
        }
        if self.min_ticks == 0 || self.min_ticks > self.tick_source.max_ticks {
            bail!("min_ticks must be in 1..=tick_source.max_ticks");
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.trainer.replay_capacity, 10_000);
        assert_eq!(config.cooldown.cooldown_secs, 3.0);
        assert_eq!(config.queue.signal_key_for("btcusdt"), "signal_history:BTCUSDT");
        assert_eq!(
            config.tick_source.stream_url("BTCUSDT"),
            "wss://stream.binance.com:9443/ws/btcusdt@trade"
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"symbol":"ethusdt","portfolio":{{"initial_cash":250.0}},"trainer":{{"batch_size":32}}}}"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.symbol, "ethusdt");
        assert_eq!(config.portfolio.initial_cash, 250.0);
        assert_eq!(config.portfolio.trade_fee_rate, 0.001);
        assert_eq!(config.trainer.batch_size, 32);
        assert_eq!(config.trainer.gamma, 0.99);
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.trainer.batch_size = config.trainer.replay_capacity + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.portfolio.trade_fee_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reward.positive_power = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("ensemble".parse::<StrategyKind>().unwrap(), StrategyKind::Ensemble);
        assert_eq!("DQN".parse::<StrategyKind>().unwrap(), StrategyKind::Learned);
        assert!("coinflip".parse::<StrategyKind>().is_err());
    }
}
