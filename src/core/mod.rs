// src/core/mod.rs

//! The central module containing the resilience and session logic of Tidegate.

pub mod dedup;
pub mod errors;
pub mod protocol;
pub mod resilience;
pub mod router;
pub mod session;
pub mod state;
pub mod tasks;
pub mod telemetry;
pub mod types;

pub use errors::DaemonError;
pub use types::{ConnectionId, Origin, SessionId};
