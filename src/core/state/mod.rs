// src/core/state/mod.rs

//! Defines the central `DaemonState` struct and its supporting counters.

mod core;
mod stats;

pub use core::{DaemonSnapshot, DaemonState, ShutdownSummary};
pub use stats::{StatsSnapshot, StatsState};
