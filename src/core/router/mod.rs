// src/core/router/mod.rs

//! Request routing: handler registry, timeout budgets, and the dispatch pipeline.

pub mod builtin;
pub mod dispatcher;
pub mod handler;
pub mod request;
pub mod timeouts;

pub use builtin::register_builtin;
pub use dispatcher::{InboundRequest, RequestRouter};
pub use handler::{
    Deadline, Handler, HandlerRegistry, HandlerRequest, NoProgress, ProgressReporter,
};
pub use request::{InFlightRequest, RequestState};
pub use timeouts::TimeoutHierarchy;
