//! Protocol error types

use tendril_core::{BlockId, TemplateId};
use thiserror::Error;

/// Errors raised while encoding or decoding wire messages
///
/// Any decode error leaves the stream in an unknown state; the connection
/// must be dropped and resumed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    /// A length field points past the end of the message
    #[error("unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A message that should be complete has bytes left over
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A value does not fit in its length-prefixed field
    #[error("{field} is {len} bytes, max {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("unknown element update mode {0}")]
    InvalidMode(u8),

    /// A value collides with a sentinel (terminator or inline marker)
    #[error("{field} value {value} is reserved")]
    ReservedId { field: &'static str, value: u16 },

    #[error("window id must be 21 bytes, got {0}")]
    InvalidWindowId(usize),

    #[error("malformed template buffer: {0}")]
    InvalidTemplate(&'static str),
}

/// Errors raised while applying decoded commands to the client mirror
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("template {0} was never installed")]
    UnknownTemplate(TemplateId),

    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),

    #[error("block {0} already exists")]
    BlockExists(BlockId),

    #[error("block {block} has no anchor {anchor}")]
    AnchorOutOfRange { block: BlockId, anchor: u8 },

    #[error("block {block} has no target {target}")]
    TargetOutOfRange { block: BlockId, target: u8 },

    /// An interned key is not present in the tables from INIT_WINDOW
    #[error("no {table} entry for code {code}")]
    UnknownKey { table: &'static str, code: u16 },

    #[error("install script of template {0} does not match its tree")]
    InvalidScript(TemplateId),

    #[error("client function {0} was never installed")]
    UnknownFunction(u16),
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
