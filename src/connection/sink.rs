// src/connection/sink.rs

//! The write half of a transport connection.

use crate::core::DaemonError;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;

/// Where a connection's encoded frames are written. Owned exclusively by the
/// connection manager, which never lets two writes overlap.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<(), DaemonError>;
    async fn close(&mut self) -> Result<(), DaemonError>;
}

/// The write half of an accepted WebSocket.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WebSocketSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), DaemonError> {
        self.inner.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DaemonError> {
        // The peer may already be gone; a failed close frame is not an error.
        let _ = self.inner.send(Message::Close(None)).await;
        self.inner.close().await?;
        Ok(())
    }
}
