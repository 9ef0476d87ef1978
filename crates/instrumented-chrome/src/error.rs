use std::fmt;

use cdp_channel::ChannelError;
use thiserror::Error;

/// High-level failure categories surfaced by the controller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InstrumentErrorKind {
    /// Page navigation did not signal completion in time.
    #[error("page load timed out")]
    LoadTimeout,
    /// A remote-control command received no correlated response in time.
    #[error("channel command timed out")]
    ChannelTimeout,
    /// The session was terminated or the browser process died; the caller
    /// must create a new session.
    #[error("session terminated")]
    SessionTerminated,
    /// The browser rejected a command or a script raised during evaluation.
    #[error("protocol failure")]
    Protocol,
    /// Launching or discovering the browser executable failed.
    #[error("browser launch failed")]
    Launch,
    #[error("internal error")]
    Internal,
}

/// Error with category, human-readable hint, and a retry hint for callers.
#[derive(Clone, Debug)]
pub struct InstrumentError {
    pub kind: InstrumentErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
}

impl InstrumentError {
    pub fn new(kind: InstrumentErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    pub fn kind(&self) -> &InstrumentErrorKind {
        &self.kind
    }
}

impl fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for InstrumentError {}

impl From<ChannelError> for InstrumentError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout(deadline) => InstrumentError::new(InstrumentErrorKind::ChannelTimeout)
                .with_hint(format!("no response within {deadline:?}"))
                .retriable(true),
            ChannelError::ConnectionClosed => {
                InstrumentError::new(InstrumentErrorKind::SessionTerminated)
                    .with_hint("remote control channel closed")
            }
            ChannelError::Protocol(message) => {
                InstrumentError::new(InstrumentErrorKind::Protocol).with_hint(message)
            }
            ChannelError::Io(message) => {
                InstrumentError::new(InstrumentErrorKind::Internal).with_hint(message)
            }
        }
    }
}
