// src/connection/mod.rs

//! Transport connections: the manager that owns every socket's write half and
//! outbound queue, and the per-connection handler that reads client frames.

mod guard;
mod handler;
mod manager;
mod outbound;
mod sink;

pub use guard::ConnectionGuard;
pub use handler::ConnectionHandler;
pub use manager::{
    ConnectionManager, ConnectionRegistration, ConnectionState, ConnectionStats, SendOutcome,
    ShutdownReport, UnregisterReport,
};
pub use outbound::OutboundQueue;
pub use sink::{FrameSink, WebSocketSink};
