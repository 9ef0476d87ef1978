//! Traffic-capturing forwarding proxy.
//!
//! The proxy sits between the instrumented browser (or any HTTP client) and
//! the target server. Every request is forwarded upstream through an injected
//! [`UriOpener`], the response is relayed back to the client, and — when the
//! capturing handler is installed — the completed pair is published to the
//! capture queue consumed by the scanning pipeline. Capture is an
//! observation: a slow or absent consumer degrades capture, never the proxied
//! exchange.

pub mod config;
pub mod http;
pub mod proxy;
pub mod queue;

use thiserror::Error;

pub use config::ProxyConfig;
pub use proxy::{
    CaptureProxy, CapturingHandler, ExchangeHandler, ForwardHandler, ProxyHandle, TcpOpener,
    UriOpener,
};
pub use queue::{CapturePublisher, CaptureQueue};

/// Failure modes surfaced by the proxy layer.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The peer sent something that does not parse as an HTTP message.
    #[error("malformed http message: {0}")]
    Parse(String),
    /// Contacting the upstream server failed; relayed to the client as a
    /// gateway error, exactly as a direct connection would have failed.
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("proxy i/o failure")]
    Io(#[from] std::io::Error),
}
