//! Shared data model for the sitehound crawling layer.
//!
//! Everything the external scanner core consumes lives here: the event
//! listener descriptor records produced by DOM introspection, the console and
//! script-error records drained from a browser session, and the raw HTTP
//! request/response pairs published by the capture proxy.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved selector standing in for the document pseudo-target.
pub const PSEUDO_DOCUMENT: &str = "!document";

/// Reserved selector standing in for the window pseudo-target.
pub const PSEUDO_WINDOW: &str = "!window";

/// DOM node-type code reported for element nodes.
pub const ELEMENT_NODE_TYPE: i32 = 1;

/// DOM node-type code reported for the document pseudo-target.
pub const DOCUMENT_NODE_TYPE: i32 = 9;

/// Sentinel node-type reported for the window pseudo-target, which has no
/// DOM node type of its own.
pub const WINDOW_NODE_TYPE: i32 = -1;

/// Identifier for one browser session and its traffic-capture lifetime.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered JavaScript event listener, as reported by
/// `get_js_event_listeners`.
///
/// Field names and the reserved pseudo values (`!document`/9, `!window`/-1)
/// are an external contract consumed by the scanner core and must not drift.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventListenerDescriptor {
    /// Selector resolving back to the listener's target: `#id`, a structural
    /// path, or one of the reserved pseudo-selectors.
    pub selector: String,
    /// Lower-case tag name, or the pseudo tag names `!document`/`!window`.
    pub tag_name: String,
    /// DOM node-type code; 9 for the document, -1 for the window.
    pub node_type: i32,
    /// Event name the listener is registered for, e.g. `click`.
    pub event_type: String,
    /// Whether the listener was registered for the capture phase.
    pub use_capture: bool,
}

impl EventListenerDescriptor {
    /// Descriptor for a listener registered on the document pseudo-target.
    pub fn for_document(event_type: impl Into<String>, use_capture: bool) -> Self {
        Self {
            selector: PSEUDO_DOCUMENT.to_string(),
            tag_name: PSEUDO_DOCUMENT.to_string(),
            node_type: DOCUMENT_NODE_TYPE,
            event_type: event_type.into(),
            use_capture,
        }
    }

    /// Descriptor for a listener registered on the window pseudo-target.
    pub fn for_window(event_type: impl Into<String>, use_capture: bool) -> Self {
        Self {
            selector: PSEUDO_WINDOW.to_string(),
            tag_name: PSEUDO_WINDOW.to_string(),
            node_type: WINDOW_NODE_TYPE,
            event_type: event_type.into(),
            use_capture,
        }
    }
}

/// Full serialized representation of the current document.
///
/// Carries no identity beyond equality; callers compare snapshots taken
/// before and after a dispatched event to detect observable mutation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot(pub String);

impl DomSnapshot {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.contains(needle)
    }
}

impl fmt::Display for DomSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One console API call observed in the page, buffered until drained.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    /// Console level: `log`, `warning`, `error`, ...
    pub level: String,
    /// Rendered message text (arguments joined with spaces).
    pub text: String,
    pub url: Option<String>,
    pub line: Option<u32>,
}

/// One unhandled script error observed in the page, buffered until drained.
///
/// A clean scanning session drains to an empty list at teardown.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JsError {
    pub message: String,
    pub url: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Raw HTTP request exactly as it crossed the capture proxy.
///
/// Headers keep their original order and casing so re-serialization emits
/// what was received.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    /// Request-target as received: origin form (`/path`) from a direct
    /// client, absolute form (`http://host/path`) from a proxied one.
    pub target: String,
    /// HTTP minor version (0 or 1).
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host (and optional port) the request addresses, from the absolute
    /// request-target when present, the `Host` header otherwise.
    pub fn host(&self) -> Option<String> {
        if let Some(rest) = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
        {
            let end = rest.find('/').unwrap_or(rest.len());
            return Some(rest[..end].to_string());
        }
        self.header("host").map(str::to_string)
    }

    /// Path and query portion of the request-target.
    pub fn path(&self) -> &str {
        if let Some(rest) = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
        {
            match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            }
        } else {
            &self.target
        }
    }

    /// Serialize back to wire form, origin-form request line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.{}\r\n", self.method, self.path(), self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Raw HTTP response exactly as it crossed the capture proxy.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// One completed request/response pair published to the capture queue.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub request: HttpRequest,
    pub response: HttpResponse,
}
