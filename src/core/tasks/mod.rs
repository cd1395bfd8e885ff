// src/core/tasks/mod.rs

//! Long-running background tasks: session sweeping, metrics flushing and
//! log draining. Each one runs until the shutdown broadcast fires.

pub mod log_drainer;
pub mod metrics_flusher;
pub mod session_sweeper;

pub use log_drainer::LogDrainer;
pub use metrics_flusher::MetricsFlusher;
pub use session_sweeper::SessionSweeper;
