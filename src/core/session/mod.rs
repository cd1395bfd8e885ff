// src/core/session/mod.rs

//! Logical sessions layered over transport connections.

pub mod manager;
pub mod types;

pub use manager::SessionManager;
pub use types::{
    ClientIdentity, CloseReason, LivenessProbe, SessionMetrics, SessionObserver, SessionSnapshot,
    SessionState, SessionStats, SweepReport,
};
