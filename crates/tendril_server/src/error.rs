//! Session error types

use tendril_core::BlockError;
use tendril_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised by windows, the window manager and the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No window with this id exists on the server
    #[error("unknown window {0}")]
    UnknownWindow(String),

    /// The window existed but has been torn down
    #[error("window {0} was destroyed")]
    WindowDestroyed(String),

    /// The connection query could not be understood
    #[error("invalid resume request: {0}")]
    InvalidResume(String),

    /// The client claims a read offset this window cannot replay from
    #[error("read offset {offset} rejected (write offset {write_offset})")]
    OffsetRejected { offset: u64, write_offset: u64 },

    #[error("transport closed")]
    TransportClosed,

    /// The application has no valid build right now
    #[error("build unavailable: {0}")]
    BuildUnavailable(String),

    /// An event name missing from the window's interning snapshot
    #[error("event {0:?} is not known to this window")]
    UnknownEvent(String),

    /// Every event handler id of the window is bound
    #[error("event handler ids exhausted")]
    HandlersExhausted,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
