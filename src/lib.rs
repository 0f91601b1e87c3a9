// src/lib.rs

pub mod config;
pub mod cooldown;
pub mod indicators;
pub mod pipeline;
pub mod portfolio;
pub mod queue;
pub mod rl;
pub mod shutdown;
pub mod summary;
pub mod tick_source;
pub mod types;
