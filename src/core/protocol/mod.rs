// src/core/protocol/mod.rs

//! The JSON frame protocol spoken over the WebSocket transport.

pub mod capabilities;
pub mod frame;

pub use capabilities::Capabilities;
pub use frame::{
    ClientFrame, ErrorBody, ErrorCode, EventFrame, HandshakeAck, HandshakeRequest,
    PROTOCOL_VERSION, RequestFrame, ResponseFrame, ServerFrame,
};
