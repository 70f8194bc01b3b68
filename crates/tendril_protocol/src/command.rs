//! Logical commands and messages carried on the wire

use serde::{Deserialize, Serialize};
use tendril_core::{
    BlockDefinition, BlockId, Content, InstallStep, TemplateId, TemplateNode, INLINE_KEY,
};

use crate::opcode::{ClientOpcode, Opcode};

/// An interned name or an inline string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Index into the matching interning table
    Code(u16),
    /// Sent as `0xFFFF` followed by the string
    Inline(String),
}

impl Key {
    /// Use `code` when present, otherwise send `name` inline
    pub fn resolve(code: Option<u16>, name: &str) -> Self {
        match code {
            Some(code) if code != INLINE_KEY => Key::Code(code),
            _ => Key::Inline(name.to_string()),
        }
    }
}

/// Template node as carried in an INSTALL_TEMPLATE buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireNode {
    Element {
        tag: Key,
        attributes: Vec<(String, String)>,
        children: Vec<WireNode>,
    },
    Text(String),
    Anchor,
}

/// Compiled template buffer: node tree plus install script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBuffer {
    pub root: WireNode,
    pub script: Vec<InstallStep>,
}

impl TemplateBuffer {
    /// Lower a definition for one window, resolving tags through `tag_key`
    pub fn from_definition(definition: &BlockDefinition, tag_key: impl Fn(&str) -> Key) -> Self {
        Self {
            root: lower(definition.root(), &tag_key),
            script: definition.script().to_vec(),
        }
    }
}

fn lower(node: &TemplateNode, tag_key: &impl Fn(&str) -> Key) -> WireNode {
    match node {
        TemplateNode::Element {
            tag,
            attributes,
            children,
            ..
        } => WireNode::Element {
            tag: tag_key(tag),
            attributes: attributes.clone(),
            children: children.iter().map(|child| lower(child, tag_key)).collect(),
        },
        TemplateNode::Text(text) => WireNode::Text(text.clone()),
        TemplateNode::Anchor => WireNode::Anchor,
    }
}

/// The four interning table dumps of INIT_WINDOW
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternDump {
    pub tags: Vec<String>,
    pub attributes: Vec<String>,
    pub styles: Vec<String>,
    pub events: Vec<String>,
}

/// Payload of INSTALL_CLIENT_FUNCTION
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFunction {
    pub arg_names: Vec<String>,
    pub body: String,
}

/// One ELEMENT_UPDATE operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementUpdate {
    /// Set a style property; an empty value removes it
    Style { key: Key, value: String },
    SetAttribute { key: Key, value: String },
    RemoveAttribute { key: Key },
    ToggleClass { name: String, on: bool },
    Checked(bool),
}

/// A server-to-client command
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    Ping,
    InstallTemplate {
        id: TemplateId,
        template: TemplateBuffer,
    },
    InitWindow {
        window_id: String,
        tables: InternDump,
    },
    AttachAnchor {
        block: BlockId,
        anchor: u8,
        content: Vec<Content>,
    },
    ClientDataSet {
        cookie: String,
        expiration: u32,
    },
    AttachEvent {
        block: BlockId,
        target: u8,
        event: u8,
        handler: u16,
    },
    Nav {
        path: String,
    },
    ElementUpdate {
        block: BlockId,
        target: u8,
        update: ElementUpdate,
    },
    InitBlock {
        block: BlockId,
        template: TemplateId,
    },
    RemoveBlocks {
        blocks: Vec<BlockId>,
    },
    InstallClientFunction {
        id: u16,
        function: ClientFunction,
    },
    RunClientFunction {
        id: u16,
        args: Vec<serde_json::Value>,
    },
}

impl ServerCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            ServerCommand::Ping => Opcode::Ping,
            ServerCommand::InstallTemplate { .. } => Opcode::InstallTemplate,
            ServerCommand::InitWindow { .. } => Opcode::InitWindow,
            ServerCommand::AttachAnchor { .. } => Opcode::AttachAnchor,
            ServerCommand::ClientDataSet { .. } => Opcode::ClientDataSet,
            ServerCommand::AttachEvent { .. } => Opcode::AttachEvent,
            ServerCommand::Nav { .. } => Opcode::Nav,
            ServerCommand::ElementUpdate { .. } => Opcode::ElementUpdate,
            ServerCommand::InitBlock { .. } => Opcode::InitBlock,
            ServerCommand::RemoveBlocks { .. } => Opcode::RemoveBlocks,
            ServerCommand::InstallClientFunction { .. } => Opcode::InstallClientFunction,
            ServerCommand::RunClientFunction { .. } => Opcode::RunClientFunction,
        }
    }
}

/// A client-to-server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Bytes of whole frames applied so far
    Pong { read_offset: u64 },
    /// A DOM event bound with ATTACH_EVENT fired
    Event { handler: u16, data: String },
    /// The user navigated back to `path`
    BackNav { path: String },
}

impl ClientMessage {
    pub fn opcode(&self) -> ClientOpcode {
        match self {
            ClientMessage::Pong { .. } => ClientOpcode::Pong,
            ClientMessage::Event { .. } => ClientOpcode::Event,
            ClientMessage::BackNav { .. } => ClientOpcode::BackNav,
        }
    }
}
