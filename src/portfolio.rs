// src/portfolio.rs
//! Simulated spot portfolio driven by the decision loop.
//!
//! A single owner mutates the state once per cycle. Every transition is applied
//! inside one synchronous call, so a cancelled loop never leaves a trade half
//! applied. Rejections are returned as a reason string, not as errors.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PortfolioConfig;
use crate::types::{PortfolioSummary, Signal};

/// Cash, position and realized PnL
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: f64,
    pub inventory: f64,
    /// Quantity-weighted average fill price including slippage; 0 when flat
    pub entry_price: f64,
    pub realized_profit: f64,
}

/// Result of applying one signal
#[derive(Debug, Clone, PartialEq)]
pub struct TradeOutcome {
    pub signal: Signal,
    pub executed: bool,
    pub quantity: f64,
    pub fee: f64,
    pub slippage_cost: f64,
    pub realized: f64,
    pub reason: String,
}

impl TradeOutcome {
    fn rejected(signal: Signal, reason: &str) -> Self {
        Self {
            signal,
            executed: false,
            quantity: 0.0,
            fee: 0.0,
            slippage_cost: 0.0,
            realized: 0.0,
            reason: reason.to_string(),
        }
    }
}

fn valid_order(price: f64, quantity: f64) -> bool {
    price.is_finite() && price > 0.0 && quantity.is_finite() && quantity > 0.0
}

pub struct PortfolioStateMachine {
    state: PortfolioState,
    initial_cash: f64,
    fee_rate: f64,
    slippage_rate: f64,
    peak_value: f64,
    /// Timestamp (ms) the current position was opened
    opened_at: Option<i64>,
}

impl PortfolioStateMachine {
    pub fn new(config: &PortfolioConfig) -> Self {
        Self {
            state: PortfolioState {
                cash: config.initial_cash,
                inventory: 0.0,
                entry_price: 0.0,
                realized_profit: 0.0,
            },
            initial_cash: config.initial_cash,
            fee_rate: config.trade_fee_rate,
            slippage_rate: config.slippage_rate,
            peak_value: config.initial_cash,
            opened_at: None,
        }
    }

    pub fn state(&self) -> PortfolioState {
        self.state
    }

    pub fn cash(&self) -> f64 {
        self.state.cash
    }

    pub fn inventory(&self) -> f64 {
        self.state.inventory
    }

    pub fn entry_price(&self) -> f64 {
        self.state.entry_price
    }

    pub fn realized_profit(&self) -> f64 {
        self.state.realized_profit
    }

    pub fn initial_cash(&self) -> f64 {
        self.initial_cash
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    pub fn slippage_rate(&self) -> f64 {
        self.slippage_rate
    }

    pub fn is_long(&self) -> bool {
        self.state.inventory > 0.0
    }

    pub fn portfolio_value(&self, price: f64) -> f64 {
        self.state.cash + self.state.inventory * price
    }

    /// Position value as a fraction of portfolio value
    pub fn inventory_ratio(&self, price: f64) -> f64 {
        let total = self.portfolio_value(price);
        if total <= 0.0 {
            return 0.0;
        }
        (self.state.inventory * price / total).clamp(0.0, 1.0)
    }

    /// Mark to market, raising the observed peak value
    pub fn mark(&mut self, price: f64) {
        let value = self.portfolio_value(price);
        if value > self.peak_value {
            self.peak_value = value;
        }
    }

    /// Fraction below the highest marked portfolio value
    pub fn drawdown_pct(&self, price: f64) -> f64 {
        if self.peak_value <= 0.0 {
            return 0.0;
        }
        ((self.peak_value - self.portfolio_value(price)) / self.peak_value).max(0.0)
    }

    pub fn holding_secs(&self, now_ms: i64) -> f64 {
        match self.opened_at {
            Some(t) if self.is_long() => ((now_ms - t).max(0) as f64) / 1000.0,
            _ => 0.0,
        }
    }

    /// Unrealized PnL on the open position
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if !self.is_long() {
            return 0.0;
        }
        (price - self.state.entry_price) * self.state.inventory
    }

    pub fn apply(&mut self, signal: Signal, price: f64, quantity: f64, timestamp: i64) -> TradeOutcome {
        match signal {
            Signal::Buy => self.buy(price, quantity, timestamp),
            Signal::Sell => self.sell(price, quantity),
            Signal::Hold => self.hold(),
        }
    }

    pub fn buy(&mut self, price: f64, quantity: f64, timestamp: i64) -> TradeOutcome {
        if !valid_order(price, quantity) {
            return TradeOutcome::rejected(Signal::Buy, "invalid price or quantity");
        }

        let fill_price = price * (1.0 + self.slippage_rate);
        let cost = fill_price * quantity;
        let fee = cost * self.fee_rate;
        let total = cost + fee;

        if self.state.cash < total {
            debug!(
                "[PORTFOLIO] BUY rejected: need ${:.4}, have ${:.4}",
                total, self.state.cash
            );
            return TradeOutcome::rejected(Signal::Buy, "insufficient cash");
        }

        let held = self.state.inventory;
        let new_inventory = held + quantity;
        self.state.entry_price = (self.state.entry_price * held + fill_price * quantity) / new_inventory;
        self.state.inventory = new_inventory;
        self.state.cash -= total;
        if held == 0.0 {
            self.opened_at = Some(timestamp);
        }

        info!(
            "[PORTFOLIO] BUY {:.6} @ {:.2} (fill {:.4}, fee {:.4}) cash=${:.4} inv={:.6}",
            quantity, price, fill_price, fee, self.state.cash, self.state.inventory
        );

        TradeOutcome {
            signal: Signal::Buy,
            executed: true,
            quantity,
            fee,
            slippage_cost: (fill_price - price) * quantity,
            realized: 0.0,
            reason: "executed".to_string(),
        }
    }

    /// Sells at most the held inventory; SELL while flat is a no-op
    pub fn sell(&mut self, price: f64, quantity: f64) -> TradeOutcome {
        if !valid_order(price, quantity) {
            return TradeOutcome::rejected(Signal::Sell, "invalid price or quantity");
        }
        if !self.is_long() {
            return TradeOutcome::rejected(Signal::Sell, "no inventory");
        }

        let quantity = quantity.min(self.state.inventory);
        let revenue = price * quantity * (1.0 - self.slippage_rate);
        let fee = revenue * self.fee_rate;
        let realized = (price - self.state.entry_price) * quantity;

        self.state.cash += revenue - fee;
        self.state.inventory -= quantity;
        self.state.realized_profit += realized;
        if self.state.inventory == 0.0 {
            self.state.entry_price = 0.0;
            self.opened_at = None;
        }

        info!(
            "[PORTFOLIO] SELL {:.6} @ {:.2} (fee {:.4}) realized={:+.4} cash=${:.4} inv={:.6}",
            quantity, price, fee, realized, self.state.cash, self.state.inventory
        );

        TradeOutcome {
            signal: Signal::Sell,
            executed: true,
            quantity,
            fee,
            slippage_cost: price * quantity * self.slippage_rate,
            realized,
            reason: "executed".to_string(),
        }
    }

    pub fn hold(&self) -> TradeOutcome {
        TradeOutcome::rejected(Signal::Hold, "hold")
    }

    pub fn summary(&self, price: f64, timestamp: i64) -> PortfolioSummary {
        let value = self.portfolio_value(price);
        let net_profit = value - self.initial_cash;
        let return_pct = if self.initial_cash > 0.0 {
            net_profit / self.initial_cash * 100.0
        } else {
            0.0
        };
        PortfolioSummary {
            timestamp,
            cash: self.state.cash,
            inventory: self.state.inventory,
            price,
            portfolio_value: value,
            net_profit,
            return_pct,
        }
    }
}
