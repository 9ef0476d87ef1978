//! Remote-control channel for a single DevTools-speaking browser process.
//!
//! The channel owns the WebSocket connection and a background read/write
//! loop. Callers issue commands with [`ControlChannel::send`] and suspend
//! until the correlated response arrives; unsolicited protocol notifications
//! are fanned out to [`ControlChannel::subscribe`] receivers without ever
//! blocking the loop. A channel is single-use: once the connection drops it
//! stays dead and every pending or future command fails with
//! [`ChannelError::ConnectionClosed`].

pub mod channel;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use channel::{CdpChannel, ChannelConfig};

/// Failure modes surfaced by the channel.
#[derive(Clone, Debug, Error)]
pub enum ChannelError {
    /// No correlated response arrived within the deadline.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// The connection to the browser is gone; the session must be recreated.
    #[error("connection closed")]
    ConnectionClosed,
    /// The browser answered the command with a protocol-level error.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Transport-level failure establishing or using the socket.
    #[error("channel i/o failure: {0}")]
    Io(String),
}

/// One unsolicited notification received from the browser.
#[derive(Clone, Debug)]
pub struct ChannelEvent {
    pub method: String,
    pub params: Value,
}

/// Command/response + event surface of a remote-control channel.
///
/// Abstracted as a trait so the browser controller can be exercised against
/// a scripted stub in tests.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send `method` with `params`, suspending until the correlated response
    /// or `deadline`.
    async fn send(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ChannelError>;

    /// Register for every notification named `method`, delivered in arrival
    /// order. Dropping the receiver unsubscribes.
    fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<ChannelEvent>;

    /// Whether the underlying connection is still usable.
    fn is_alive(&self) -> bool;

    /// Tear the channel down; idempotent.
    fn close(&self);
}
