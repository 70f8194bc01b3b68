//! Tendril Protocol
//!
//! The binary command stream between a tendril server and the browser.
//!
//! - [`command`]: logical server commands and client messages
//! - [`encode`] / [`decode`]: big-endian byte layout of both directions
//! - [`template`]: the INSTALL_TEMPLATE buffer format
//! - [`mirror`]: an in-memory client that applies frames the way the
//!   browser interpreter does
//!
//! # Example
//!
//! ```rust
//! use tendril_core::Content;
//! use tendril_protocol::{decode_frame, encode_frame, ServerCommand};
//!
//! let frame = encode_frame(&[ServerCommand::AttachAnchor {
//!     block: 0,
//!     anchor: 0,
//!     content: vec![Content::from("hello")],
//! }])
//! .unwrap();
//!
//! let commands = decode_frame(&frame).unwrap();
//! assert_eq!(commands.len(), 1);
//! ```

pub mod command;
pub mod decode;
pub mod encode;
pub mod error;
pub mod mirror;
pub mod opcode;
pub mod template;

pub use command::{
    ClientFunction, ClientMessage, ElementUpdate, InternDump, Key, ServerCommand, TemplateBuffer,
    WireNode,
};
pub use decode::{decode_client_message, decode_command, decode_frame, ByteReader};
pub use encode::{encode_client_message, encode_command, encode_frame};
pub use error::{MirrorError, ProtocolError, Result};
pub use mirror::{DomMirror, DomNodeId, DomNodeKind};
pub use opcode::{
    ClientOpcode, Opcode, UpdateMode, ANCHOR_END, BLOCK_REF_FLAG, REMOVE_END, WINDOW_ID_LEN,
};
pub use template::{decode_template, encode_template, MAX_TEMPLATE_DEPTH};
