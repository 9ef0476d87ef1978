//! sitehound — the JavaScript-aware crawling layer of a web-application
//! security scanner.
//!
//! Two tightly coupled subsystems: an instrumented browser controller that
//! drives Chrome to exercise dynamically generated pages the way a user
//! would, and a traffic-capturing proxy that forwards every HTTP exchange
//! unmodified while publishing a copy to the capture queue consumed by the
//! scanner's crawl/audit pipeline.
//!
//! [`CrawlerSession`] wires the two together: it boots the proxy, launches
//! the browser with its traffic routed through it, and exposes the
//! controller surface plus the queue.

pub mod session;

use thiserror::Error;

pub use capture_proxy::{
    CaptureProxy, CapturePublisher, CaptureQueue, CapturingHandler, ExchangeHandler,
    ForwardHandler, ProxyConfig, ProxyError, TcpOpener, UriOpener,
};
pub use cdp_channel::{CdpChannel, ChannelConfig, ChannelError, ChannelEvent, ControlChannel};
pub use instrumented_chrome::{
    ChromeConfig, InstrumentError, InstrumentErrorKind, InstrumentedChrome,
};
pub use scan_types::{
    CapturedExchange, ConsoleMessage, DomSnapshot, EventListenerDescriptor, HttpRequest,
    HttpResponse, JsError, SessionId, DOCUMENT_NODE_TYPE, ELEMENT_NODE_TYPE, PSEUDO_DOCUMENT,
    PSEUDO_WINDOW, WINDOW_NODE_TYPE,
};
pub use session::{CrawlerConfig, CrawlerSession};

/// Failures setting up or tearing down a crawl session.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("browser error: {0}")]
    Browser(#[from] InstrumentError),
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
}
