//! Core error types

use thiserror::Error;

use crate::block::{BlockId, TemplateId};

/// Errors raised while running reactive computations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    /// A fallible computation returned an error
    #[error("computation failed: {message}")]
    Computation { message: String },

    /// A computation panicked; the panic was contained to the graph
    #[error("computation panicked: {message}")]
    Panicked { message: String },

    /// A single flush ran more computations than the loop limit allows
    #[error("potential infinite loop: more than {limit} computations in one flush")]
    PotentialCycle { limit: usize },
}

/// Errors raised by the block model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// No definition is registered under this id
    #[error("template {0} is not installed")]
    UnknownTemplate(TemplateId),

    /// A different definition was already installed under this id
    #[error("template {0} is already installed with a different shape")]
    TemplateConflict(TemplateId),

    /// The template root must be an element
    #[error("template {0} root must be an element")]
    InvalidRoot(TemplateId),

    /// The template needs more references than the install script can address
    #[error("template has too many {what} (max {max})")]
    TemplateTooLarge { what: &'static str, max: usize },

    /// Every block id in the session is in use
    #[error("block id space exhausted")]
    IdsExhausted,

    /// The block id is not live in this session
    #[error("block {0} does not exist")]
    UnknownBlock(BlockId),

    #[error("block {block} has no anchor {anchor}")]
    AnchorOutOfRange { block: BlockId, anchor: u8 },

    #[error("block {block} has no target {target}")]
    TargetOutOfRange { block: BlockId, target: u8 },

    /// A block would end up inside its own subtree
    #[error("block {0} cannot be attached inside itself")]
    CyclicAttach(BlockId),

    /// The same block appears twice in one anchor's content
    #[error("block {0} appears more than once in the same content list")]
    DuplicateContent(BlockId),
}

/// Result type for block model operations
pub type Result<T> = std::result::Result<T, BlockError>;
