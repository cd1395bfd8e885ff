// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;

/// The daemon version reported on `/snapshot`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export
pub use crate::core::DaemonError;
pub use crate::core::state::DaemonState;
