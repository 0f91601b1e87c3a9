// src/pipeline.rs
//! Inference side: one decision cycle per interval.
//!
//! Each cycle snapshots the tick window, builds features, decides, gates the
//! decision through the cooldown, applies it to the paper portfolio and
//! publishes a trade record. The experience for cycle t is only emitted at
//! cycle t+1, once the next observation and price are known; shutdown emits
//! the last pending one with `done = true`.
//!
//! Queue writes are fire-and-forget: a failed push is logged and counted, and
//! the cycle carries on deciding and trading.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;
use crate::cooldown::CooldownGate;
use crate::indicators::IndicatorSet;
use crate::portfolio::PortfolioStateMachine;
use crate::queue::QueueStore;
use crate::rl::decision::{build_engine, DecisionEngine};
use crate::rl::evaluator::{EvaluatorAgent, TradeSample};
use crate::rl::feature_extractor::{build_features, FeatureContext, FeatureVector};
use crate::rl::reward::{tick_volatility, RewardInput, RewardShaper};
use crate::shutdown::Shutdown;
use crate::summary::SummaryPublisher;
use crate::tick_source::TickSource;
use crate::types::{Experience, Signal, Tick, TradeRecord};

/// Decision awaiting its outcome
#[derive(Debug, Clone)]
struct PendingExperience {
    state: Vec<f32>,
    /// Action actually applied
    signal: Signal,
    price: f64,
    quantity: f64,
}

/// What one cycle did, for logs and tests
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub decided: Signal,
    pub applied: Signal,
    pub executed: bool,
    pub cooldown_override: bool,
    pub price: f64,
    /// Reward of the previous cycle's experience, emitted this cycle
    pub emitted_reward: Option<f64>,
}

pub struct InferencePipeline {
    config: AppConfig,
    ticks: TickSource,
    indicators: IndicatorSet,
    engine: Box<dyn DecisionEngine>,
    cooldown: CooldownGate,
    portfolio: PortfolioStateMachine,
    shaper: RewardShaper,
    evaluator: EvaluatorAgent,
    store: Arc<QueueStore>,
    summary: SummaryPublisher,
    signal_key: String,
    pending: Option<PendingExperience>,
    cycles: u64,
    store_failures: u64,
}

impl InferencePipeline {
    pub fn new(config: AppConfig, ticks: TickSource, store: Arc<QueueStore>) -> Self {
        let engine = build_engine(&config);
        Self::with_engine(config, ticks, store, engine)
    }

    pub fn with_engine(
        config: AppConfig,
        ticks: TickSource,
        store: Arc<QueueStore>,
        engine: Box<dyn DecisionEngine>,
    ) -> Self {
        let portfolio = PortfolioStateMachine::new(&config.portfolio);
        let shaper = RewardShaper::new(
            &config.reward,
            config.portfolio.trade_fee_rate,
            config.portfolio.slippage_rate,
        );
        Self {
            indicators: IndicatorSet::default(),
            cooldown: CooldownGate::new(&config.cooldown),
            evaluator: EvaluatorAgent::new(&config.evaluator),
            summary: SummaryPublisher::new(&config.queue.summary_key, config.summary.publish_interval_ms),
            signal_key: config.queue.signal_key_for(&config.symbol),
            portfolio,
            shaper,
            engine,
            ticks,
            store,
            config,
            pending: None,
            cycles: 0,
            store_failures: 0,
        }
    }

    pub fn portfolio(&self) -> &PortfolioStateMachine {
        &self.portfolio
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Queue writes that failed since start
    pub fn store_failures(&self) -> u64 {
        self.store_failures
    }

    fn store_failed(&mut self, what: &str, e: &anyhow::Error) {
        self.store_failures += 1;
        warn!("[QUEUE] {} write failed ({} so far): {:#}", what, self.store_failures, e);
    }

    fn observe(&self, window: &[Tick], feedback: &HashMap<String, f64>, now_ms: i64) -> FeatureVector {
        let price = window.last().map(|t| t.price).unwrap_or(0.0);
        let ctx = FeatureContext {
            current_price: price,
            inventory: self.portfolio.inventory(),
            cash: self.portfolio.cash(),
            entry_price: self.portfolio.entry_price(),
            drawdown_pct: self.portfolio.drawdown_pct(price),
            holding_secs: self.portfolio.holding_secs(now_ms),
        };
        build_features(window, &ctx, feedback)
    }

    /// Score the pending decision against the price now observed and push it.
    /// The reward is returned even when the push fails.
    fn complete_pending(
        &mut self,
        next_state: &[f32],
        next_price: f64,
        window: &[Tick],
        done: bool,
    ) -> Option<f64> {
        let pending = self.pending.take()?;
        let input = RewardInput {
            signal: pending.signal,
            decision_price: pending.price,
            next_price,
            inventory: self.portfolio.inventory(),
            entry_price: self.portfolio.entry_price(),
            inventory_ratio: self.portfolio.inventory_ratio(next_price),
        };
        let feedback = self.evaluator.generate_feedback();
        let breakdown = self.shaper.compute(&input, window, &feedback);

        let exp = Experience {
            state: pending.state,
            action: pending.signal.to_action(),
            reward: breakdown.reward as f32,
            next_state: next_state.to_vec(),
            done,
            quantity: pending.quantity,
        };
        match self.store.push_experience(&self.config.queue.experience_key, &exp) {
            Ok(()) => debug!(
                "[QUEUE] Experience {} reward={:+.5} done={}",
                pending.signal, breakdown.reward, done
            ),
            Err(e) => self.store_failed("Experience", &e),
        }
        Some(breakdown.reward)
    }

    /// Run one decision cycle at `now_ms`. Returns None when the tick window
    /// is still too short.
    pub async fn run_cycle(&mut self, now_ms: i64) -> Result<Option<CycleReport>> {
        let window = self.ticks.get_recent_ticks().await;
        if window.len() < self.config.min_ticks {
            debug!("[CYCLE] Waiting for ticks ({}/{})", window.len(), self.config.min_ticks);
            return Ok(None);
        }
        let Some(price) = window.last().map(|t| t.price) else {
            return Ok(None);
        };

        let feedback = self.indicators.feedback(&window);
        self.portfolio.mark(price);
        let features = self.observe(&window, &feedback, now_ms);
        trace!("[CYCLE] Features\n{}", features);
        let state = features.values();

        let emitted_reward = self.complete_pending(&state, price, &window, false);

        self.engine.refresh();
        let decision = self.engine.decide(&features);
        let (gated, cooldown_override) = self.cooldown.gate(decision.signal, now_ms);

        let held_secs = self.portfolio.holding_secs(now_ms);
        let outcome = self.portfolio.apply(gated, price, decision.quantity, now_ms);
        if outcome.executed {
            self.cooldown.record_trade(now_ms);
            info!(
                "[PORTFOLIO] {} {:.6} @ {:.2} fee={:.4} | cash={:.2} inv={:.6}",
                gated,
                outcome.quantity,
                price,
                outcome.fee,
                self.portfolio.cash(),
                self.portfolio.inventory()
            );
            if gated == Signal::Sell {
                self.evaluator.record_trade(TradeSample {
                    realized_pnl: outcome.realized,
                    portfolio_value: self.portfolio.portfolio_value(price),
                    duration_secs: held_secs,
                    volatility: tick_volatility(&window, self.config.reward.volatility_window),
                    slippage_cost: outcome.slippage_cost,
                    fee_cost: outcome.fee,
                });
            }
        } else if gated.is_trade() {
            debug!("[CYCLE] {} not executed: {}", gated, outcome.reason);
        }
        let applied = if outcome.executed { gated } else { Signal::Hold };

        self.pending = Some(PendingExperience {
            state,
            signal: applied,
            price,
            quantity: decision.quantity,
        });

        let reason = if cooldown_override {
            format!("{} | cooldown: HOLD", decision.reason)
        } else {
            decision.reason.clone()
        };
        let record = TradeRecord {
            timestamp: now_ms,
            symbol: self.config.symbol.to_uppercase(),
            signal: applied,
            price,
            quantity: decision.quantity,
            cash: self.portfolio.cash(),
            inventory: self.portfolio.inventory(),
            reason,
            forced: decision.forced || cooldown_override,
            votes: decision.votes.clone(),
            take_profit_pct: decision.take_profit_pct,
            model_version: self.engine.model_version(),
            reward: emitted_reward,
            features: features.entries().to_vec(),
        };
        if let Err(e) = self.store.push_signal_record(
            &self.signal_key,
            &record,
            self.config.queue.max_signal_history,
        ) {
            self.store_failed("Signal record", &e);
        }
        let summary = self.portfolio.summary(price, now_ms);
        if let Err(e) = self.summary.maybe_publish(&self.store, &summary) {
            self.store_failed("Summary", &e);
        }

        self.cycles += 1;
        debug!(
            "[CYCLE] #{} {} -> {} @ {:.2} ({})",
            self.cycles, decision.signal, applied, price, record.reason
        );

        Ok(Some(CycleReport {
            decided: decision.signal,
            applied,
            executed: outcome.executed,
            cooldown_override,
            price,
            emitted_reward,
        }))
    }

    /// Emit the pending experience as terminal and publish a final summary
    pub async fn flush(&mut self, now_ms: i64) -> Result<Option<f64>> {
        let window = self.ticks.get_recent_ticks().await;
        let Some(price) = window.last().map(|t| t.price) else {
            if self.pending.take().is_some() {
                warn!("[CYCLE] Dropping pending experience: no ticks to score it");
            }
            return Ok(None);
        };
        let feedback = self.indicators.feedback(&window);
        let state = self.observe(&window, &feedback, now_ms).values();
        let reward = self.complete_pending(&state, price, &window, true);
        let summary = self.portfolio.summary(price, now_ms);
        if let Err(e) = self.summary.publish(&self.store, &summary) {
            self.store_failed("Summary", &e);
        }
        Ok(reward)
    }

    /// Cycle on a fixed interval until cancelled. Cycle errors are logged and
    /// the loop keeps going.
    pub async fn run(&mut self, shutdown: Shutdown) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.cycle_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "[CYCLE] Starting {} pipeline for {} every {} ms",
            self.engine.name(),
            self.config.symbol.to_uppercase(),
            self.config.cycle_interval_ms
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    if let Err(e) = self.run_cycle(now_ms).await {
                        warn!("[CYCLE] Cycle failed: {:#}", e);
                    }
                }
            }
        }

        info!("[CYCLE] Shutting down after {} cycles", self.cycles);
        self.flush(chrono::Utc::now().timestamp_millis()).await?;
        Ok(())
    }
}
