//! Client-side DOM mirror
//!
//! [`DomMirror`] is the decoder half of the protocol: it applies server
//! frames to an in-memory DOM arena exactly the way the browser interpreter
//! does, keeps the read offset used for resumption, and produces the
//! client-to-server messages (PONG, EVENT, BACK_NAV).
//!
//! Anchor content lives directly before the anchor's placeholder comment.
//! Replacing it uses at most one transient marker node:
//!
//! 1. insert the marker before the first old node
//! 2. remove every old node
//! 3. insert every new node before the marker
//! 4. remove the marker

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tendril_core::{BlockId, Content, StepKind, StepRole, TemplateId, ROOT_BLOCK, ROOT_TARGET};

use crate::command::{
    ClientFunction, ClientMessage, ElementUpdate, InternDump, Key, ServerCommand, TemplateBuffer,
    WireNode,
};
use crate::decode::decode_frame;
use crate::encode::encode_client_message;
use crate::error::MirrorError;

type Result<T> = std::result::Result<T, MirrorError>;

/// Index of a node in the mirror's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomNodeId(usize);

/// What a mirrored DOM node is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomNodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
        styles: Vec<(String, String)>,
        checked: bool,
    },
    Text(String),
    /// Anchor placeholder or transient swap marker
    Comment,
}

#[derive(Debug, Clone)]
struct DomNode {
    kind: DomNodeKind,
    parent: Option<DomNodeId>,
    children: Vec<DomNodeId>,
}

#[derive(Debug, Clone)]
struct MirrorAnchor {
    placeholder: DomNodeId,
    content: Vec<DomNodeId>,
}

#[derive(Debug, Clone)]
struct MirrorBlock {
    root: DomNodeId,
    targets: Vec<DomNodeId>,
    anchors: Vec<MirrorAnchor>,
}

/// In-memory client that applies the server's command stream
#[derive(Debug)]
pub struct DomMirror {
    nodes: Vec<DomNode>,
    /// Arena slots released by REMOVE_BLOCKS and anchor swaps
    free: Vec<DomNodeId>,
    document: DomNodeId,
    window_id: Option<String>,
    tables: InternDump,
    templates: FxHashMap<TemplateId, TemplateBuffer>,
    blocks: FxHashMap<BlockId, MirrorBlock>,
    /// Anchor currently holding each attached block root
    placement: FxHashMap<DomNodeId, (BlockId, u8)>,
    listeners: FxHashMap<(DomNodeId, u8), u16>,
    cookies: Vec<(String, u32)>,
    functions: FxHashMap<u16, ClientFunction>,
    calls: Vec<(u16, Vec<serde_json::Value>)>,
    history: Vec<String>,
    read_offset: u64,
    outbox: Vec<Bytes>,
    live_markers: usize,
    peak_markers: usize,
}

impl DomMirror {
    pub fn new() -> Self {
        let mut mirror = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            document: DomNodeId(0),
            window_id: None,
            tables: InternDump::default(),
            templates: FxHashMap::default(),
            blocks: FxHashMap::default(),
            placement: FxHashMap::default(),
            listeners: FxHashMap::default(),
            cookies: Vec::new(),
            functions: FxHashMap::default(),
            calls: Vec::new(),
            history: Vec::new(),
            read_offset: 0,
            outbox: Vec::new(),
            live_markers: 0,
            peak_markers: 0,
        };
        let document = mirror.create(DomNodeKind::Element {
            tag: "body".to_string(),
            attributes: Vec::new(),
            styles: Vec::new(),
            checked: false,
        });
        let mount = mirror.create(DomNodeKind::Comment);
        mirror.append(document, mount);
        mirror.document = document;
        mirror.blocks.insert(
            ROOT_BLOCK,
            MirrorBlock {
                root: document,
                targets: Vec::new(),
                anchors: vec![MirrorAnchor {
                    placeholder: mount,
                    content: Vec::new(),
                }],
            },
        );
        mirror
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Apply one transport frame
    ///
    /// The frame is decoded completely before anything is applied. Any error
    /// means the stream can no longer be trusted and the connection must be
    /// resumed or reloaded.
    pub fn receive(&mut self, frame: &[u8]) -> Result<()> {
        let commands = decode_frame(frame)?;
        let mut ping = false;
        for command in commands {
            tracing::trace!(opcode = ?command.opcode(), "mirror applying command");
            match command {
                ServerCommand::Ping => ping = true,
                other => self.apply(other)?,
            }
        }
        self.read_offset += frame.len() as u64;
        if ping {
            self.send(&ClientMessage::Pong {
                read_offset: self.read_offset,
            })?;
        }
        Ok(())
    }

    fn apply(&mut self, command: ServerCommand) -> Result<()> {
        match command {
            ServerCommand::Ping => {}
            ServerCommand::InstallTemplate { id, template } => {
                self.templates.insert(id, template);
            }
            ServerCommand::InitWindow { window_id, tables } => {
                self.window_id = Some(window_id);
                self.tables = tables;
            }
            ServerCommand::InitBlock { block, template } => self.init_block(block, template)?,
            ServerCommand::AttachAnchor {
                block,
                anchor,
                content,
            } => self.attach(block, anchor, &content)?,
            ServerCommand::RemoveBlocks { blocks } => {
                for block in blocks {
                    self.remove_block(block)?;
                }
            }
            ServerCommand::AttachEvent {
                block,
                target,
                event,
                handler,
            } => {
                let node = self.target(block, target)?;
                self.listeners.insert((node, event), handler);
            }
            ServerCommand::ElementUpdate {
                block,
                target,
                update,
            } => self.update_element(block, target, update)?,
            ServerCommand::Nav { path } => self.history.push(path),
            ServerCommand::ClientDataSet { cookie, expiration } => {
                self.cookies.push((cookie, expiration));
            }
            ServerCommand::InstallClientFunction { id, function } => {
                self.functions.insert(id, function);
            }
            ServerCommand::RunClientFunction { id, args } => {
                if !self.functions.contains_key(&id) {
                    return Err(MirrorError::UnknownFunction(id));
                }
                self.calls.push((id, args));
            }
        }
        Ok(())
    }

    fn init_block(&mut self, block: BlockId, template: TemplateId) -> Result<()> {
        if self.blocks.contains_key(&block) {
            return Err(MirrorError::BlockExists(block));
        }
        let buffer = self
            .templates
            .get(&template)
            .cloned()
            .ok_or(MirrorError::UnknownTemplate(template))?;

        let root = self.clone_tree(&buffer.root)?;
        let mut refs = vec![root];
        let mut targets = Vec::new();
        let mut anchors = Vec::new();
        for step in &buffer.script {
            let base = *refs
                .get(usize::from(step.from))
                .ok_or(MirrorError::InvalidScript(template))?;
            let node = match step.kind {
                StepKind::FirstChild => self.nodes[base.0].children.first().copied(),
                StepKind::NextSibling => self.next_sibling(base),
            }
            .ok_or(MirrorError::InvalidScript(template))?;
            refs.push(node);

            match step.role {
                StepRole::Path => {}
                StepRole::Target => targets.push(node),
                StepRole::Anchor => {
                    if self.nodes[node.0].kind != DomNodeKind::Comment {
                        return Err(MirrorError::InvalidScript(template));
                    }
                    anchors.push(MirrorAnchor {
                        placeholder: node,
                        content: Vec::new(),
                    });
                }
            }
        }

        self.blocks.insert(
            block,
            MirrorBlock {
                root,
                targets,
                anchors,
            },
        );
        Ok(())
    }

    fn clone_tree(&mut self, node: &WireNode) -> Result<DomNodeId> {
        match node {
            WireNode::Element {
                tag,
                attributes,
                children,
            } => {
                let tag = self.key_name(&self.tables.tags, "tags", tag)?;
                let element = self.create(DomNodeKind::Element {
                    tag,
                    attributes: attributes.clone(),
                    styles: Vec::new(),
                    checked: false,
                });
                for child in children {
                    let child = self.clone_tree(child)?;
                    self.append(element, child);
                }
                Ok(element)
            }
            WireNode::Text(text) => Ok(self.create(DomNodeKind::Text(text.clone()))),
            WireNode::Anchor => Ok(self.create(DomNodeKind::Comment)),
        }
    }

    fn attach(&mut self, block: BlockId, anchor: u8, content: &[Content]) -> Result<()> {
        let placeholder = self.anchor(block, anchor)?.placeholder;
        let parent = self.nodes[placeholder.0]
            .parent
            .ok_or(MirrorError::AnchorOutOfRange { block, anchor })?;

        let mut incoming = Vec::with_capacity(content.len());
        let mut block_roots = Vec::new();
        for item in content {
            match item {
                Content::Text(text) => incoming.push(self.create(DomNodeKind::Text(text.clone()))),
                Content::Block(id) => {
                    let root = self
                        .blocks
                        .get(id)
                        .map(|child| child.root)
                        .ok_or(MirrorError::UnknownBlock(*id))?;
                    incoming.push(root);
                    block_roots.push(root);
                }
            }
        }

        // blocks moving in from another anchor leave that anchor's list
        for root in &block_roots {
            if let Some(from) = self.placement.remove(root) {
                if from != (block, anchor) {
                    if let Ok(previous) = self.anchor_mut(from.0, from.1) {
                        previous.content.retain(|node| node != root);
                    }
                }
            }
        }

        let outgoing: Vec<DomNodeId> = std::mem::take(&mut self.anchor_mut(block, anchor)?.content)
            .into_iter()
            // a node may already have been moved elsewhere
            .filter(|node| self.nodes[node.0].parent == Some(parent))
            .collect();
        for node in &outgoing {
            if self.placement.get(node) == Some(&(block, anchor)) {
                self.placement.remove(node);
            }
        }

        match outgoing.first().copied() {
            None => {
                for node in &incoming {
                    self.insert_before(parent, *node, placeholder);
                }
            }
            Some(first) => {
                let marker = self.create(DomNodeKind::Comment);
                self.insert_before(parent, marker, first);
                self.live_markers += 1;
                self.peak_markers = self.peak_markers.max(self.live_markers);

                for node in &outgoing {
                    self.detach(*node);
                }
                for node in &incoming {
                    self.insert_before(parent, *node, marker);
                }

                self.detach(marker);
                self.release(marker);
                self.live_markers -= 1;
            }
        }

        // loose text dies with the swap; block roots wait for REMOVE_BLOCKS
        for node in outgoing {
            if matches!(self.nodes[node.0].kind, DomNodeKind::Text(_)) {
                self.release(node);
            }
        }

        for root in block_roots {
            self.placement.insert(root, (block, anchor));
        }
        self.anchor_mut(block, anchor)?.content = incoming;
        Ok(())
    }

    fn remove_block(&mut self, block: BlockId) -> Result<()> {
        let removed = self
            .blocks
            .remove(&block)
            .ok_or(MirrorError::UnknownBlock(block))?;
        if let Some(from) = self.placement.remove(&removed.root) {
            if let Ok(anchor) = self.anchor_mut(from.0, from.1) {
                anchor.content.retain(|node| *node != removed.root);
            }
        }
        self.listeners.retain(|(node, _), _| {
            *node != removed.root && !removed.targets.contains(node)
        });
        self.release(removed.root);
        Ok(())
    }

    fn update_element(&mut self, block: BlockId, target: u8, update: ElementUpdate) -> Result<()> {
        let node = self.target(block, target)?;
        let resolved = match &update {
            ElementUpdate::Style { key, .. } => Some(self.key_name(&self.tables.styles, "styles", key)?),
            ElementUpdate::SetAttribute { key, .. } | ElementUpdate::RemoveAttribute { key } => {
                Some(self.key_name(&self.tables.attributes, "attributes", key)?)
            }
            _ => None,
        };

        let DomNodeKind::Element {
            attributes,
            styles,
            checked,
            ..
        } = &mut self.nodes[node.0].kind
        else {
            return Err(MirrorError::TargetOutOfRange { block, target });
        };

        match (update, resolved) {
            (ElementUpdate::Style { value, .. }, Some(name)) => {
                styles.retain(|(existing, _)| *existing != name);
                if !value.is_empty() {
                    styles.push((name, value));
                }
            }
            (ElementUpdate::SetAttribute { value, .. }, Some(name)) => {
                match attributes.iter_mut().find(|(existing, _)| *existing == name) {
                    Some(slot) => slot.1 = value,
                    None => attributes.push((name, value)),
                }
            }
            (ElementUpdate::RemoveAttribute { .. }, Some(name)) => {
                attributes.retain(|(existing, _)| *existing != name);
            }
            (ElementUpdate::ToggleClass { name, on }, _) => {
                let current = attributes
                    .iter()
                    .find(|(existing, _)| existing == "class")
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                let mut classes: Vec<&str> =
                    current.split_whitespace().filter(|class| *class != name).collect();
                if on {
                    classes.push(&name);
                }
                let joined = classes.join(" ");
                attributes.retain(|(existing, _)| existing != "class");
                if !joined.is_empty() {
                    attributes.push(("class".to_string(), joined));
                }
            }
            (ElementUpdate::Checked(value), _) => *checked = value,
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let bytes = encode_client_message(message)?;
        self.outbox.push(bytes);
        Ok(())
    }

    /// Queue a heartbeat carrying the current read offset
    pub fn heartbeat(&mut self) -> Result<()> {
        self.send(&ClientMessage::Pong {
            read_offset: self.read_offset,
        })
    }

    /// Fire a DOM event on a target
    ///
    /// Returns whether a handler was bound; only bound events reach the server.
    pub fn dispatch(&mut self, block: BlockId, target: u8, event: &str, data: &str) -> Result<bool> {
        let node = self.target(block, target)?;
        let Some(code) = self.tables.events.iter().position(|name| name == event) else {
            return Ok(false);
        };
        let Ok(code) = u8::try_from(code) else {
            return Ok(false);
        };
        let Some(handler) = self.listeners.get(&(node, code)).copied() else {
            return Ok(false);
        };
        self.send(&ClientMessage::Event {
            handler,
            data: data.to_string(),
        })?;
        Ok(true)
    }

    /// The user pressed back, landing on `path`
    pub fn back(&mut self, path: &str) -> Result<()> {
        self.history.pop();
        self.send(&ClientMessage::BackNav {
            path: path.to_string(),
        })
    }

    /// Messages waiting to be sent to the server, oldest first
    pub fn take_outgoing(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Bytes of whole frames applied so far
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn window_id(&self) -> Option<&str> {
        self.window_id.as_deref()
    }

    /// Most swap markers that were ever in the DOM at once
    pub fn peak_markers(&self) -> usize {
        self.peak_markers
    }

    pub fn has_block(&self, block: BlockId) -> bool {
        self.blocks.contains_key(&block)
    }

    /// Nodes currently allocated in the arena, attached or not
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Live blocks, not counting the document block
    pub fn block_count(&self) -> usize {
        self.blocks.len() - 1
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn cookies(&self) -> &[(String, u32)] {
        &self.cookies
    }

    pub fn function_calls(&self) -> &[(u16, Vec<serde_json::Value>)] {
        &self.calls
    }

    /// Kind of the node behind a target address
    pub fn target_kind(&self, block: BlockId, target: u8) -> Result<&DomNodeKind> {
        let node = self.target(block, target)?;
        Ok(&self.nodes[node.0].kind)
    }

    /// Serialized document body, without comments
    pub fn html(&self) -> String {
        let mut out = String::new();
        for child in &self.nodes[self.document.0].children {
            self.render(*child, &mut out);
        }
        out
    }

    /// Concatenated text of the document
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(self.document, &mut out);
        out
    }

    fn render(&self, node: DomNodeId, out: &mut String) {
        let entry = &self.nodes[node.0];
        match &entry.kind {
            DomNodeKind::Element {
                tag,
                attributes,
                styles,
                checked,
            } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    out.push_str(&format!(" {name}=\"{value}\""));
                }
                if !styles.is_empty() {
                    let style: String = styles
                        .iter()
                        .map(|(name, value)| format!("{name}:{value};"))
                        .collect();
                    out.push_str(&format!(" style=\"{style}\""));
                }
                if *checked {
                    out.push_str(" checked");
                }
                out.push('>');
                for child in &entry.children {
                    self.render(*child, out);
                }
                out.push_str(&format!("</{tag}>"));
            }
            DomNodeKind::Text(text) => out.push_str(text),
            DomNodeKind::Comment => {}
        }
    }

    fn collect_text(&self, node: DomNodeId, out: &mut String) {
        let entry = &self.nodes[node.0];
        if let DomNodeKind::Text(text) = &entry.kind {
            out.push_str(text);
        }
        for child in &entry.children {
            self.collect_text(*child, out);
        }
    }

    // =========================================================================
    // Arena
    // =========================================================================

    fn create(&mut self, kind: DomNodeKind) -> DomNodeId {
        let node = DomNode {
            kind,
            parent: None,
            children: Vec::new(),
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                DomNodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Return a subtree's slots to the free list
    ///
    /// Roots of other blocks found inside are only cut loose; they are freed
    /// when their own REMOVE_BLOCKS arrives.
    fn release(&mut self, node: DomNodeId) {
        self.detach(node);
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            for child in std::mem::take(&mut self.nodes[current.0].children) {
                if self.placement.contains_key(&child) {
                    self.nodes[child.0].parent = None;
                } else {
                    stack.push(child);
                }
            }
            self.nodes[current.0].kind = DomNodeKind::Comment;
            self.free.push(current);
        }
    }

    fn append(&mut self, parent: DomNodeId, child: DomNodeId) {
        self.detach(child);
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parent = Some(parent);
    }

    fn insert_before(&mut self, parent: DomNodeId, child: DomNodeId, reference: DomNodeId) {
        self.detach(child);
        let siblings = &mut self.nodes[parent.0].children;
        let index = siblings
            .iter()
            .position(|node| *node == reference)
            .unwrap_or(siblings.len());
        siblings.insert(index, child);
        self.nodes[child.0].parent = Some(parent);
    }

    fn detach(&mut self, node: DomNodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|child| *child != node);
        }
    }

    fn next_sibling(&self, node: DomNodeId) -> Option<DomNodeId> {
        let parent = self.nodes[node.0].parent?;
        let siblings = &self.nodes[parent.0].children;
        let index = siblings.iter().position(|child| *child == node)?;
        siblings.get(index + 1).copied()
    }

    fn key_name(&self, table: &[String], name: &'static str, key: &Key) -> Result<String> {
        match key {
            Key::Inline(value) => Ok(value.clone()),
            Key::Code(code) => table
                .get(usize::from(*code))
                .cloned()
                .ok_or(MirrorError::UnknownKey { table: name, code: *code }),
        }
    }

    fn anchor(&self, block: BlockId, anchor: u8) -> Result<&MirrorAnchor> {
        self.blocks
            .get(&block)
            .ok_or(MirrorError::UnknownBlock(block))?
            .anchors
            .get(usize::from(anchor))
            .ok_or(MirrorError::AnchorOutOfRange { block, anchor })
    }

    fn anchor_mut(&mut self, block: BlockId, anchor: u8) -> Result<&mut MirrorAnchor> {
        self.blocks
            .get_mut(&block)
            .ok_or(MirrorError::UnknownBlock(block))?
            .anchors
            .get_mut(usize::from(anchor))
            .ok_or(MirrorError::AnchorOutOfRange { block, anchor })
    }

    fn target(&self, block: BlockId, target: u8) -> Result<DomNodeId> {
        let entry = self
            .blocks
            .get(&block)
            .ok_or(MirrorError::UnknownBlock(block))?;
        if target == ROOT_TARGET {
            return Ok(entry.root);
        }
        entry
            .targets
            .get(usize::from(target))
            .copied()
            .ok_or(MirrorError::TargetOutOfRange { block, target })
    }
}

impl Default for DomMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_client_message;
    use crate::encode::encode_frame;
    use tendril_core::{BlockDefinition, TemplateNode};

    const WINDOW: &str = "abcdefghijklmnopqrstu";

    fn tables() -> InternDump {
        InternDump {
            tags: vec!["div".into(), "li".into(), "button".into()],
            attributes: vec!["id".into(), "title".into()],
            styles: vec!["color".into()],
            events: vec!["click".into()],
        }
    }

    fn install(id: TemplateId, root: TemplateNode) -> ServerCommand {
        let definition = BlockDefinition::new(id, root).unwrap();
        let lookup = tables();
        ServerCommand::InstallTemplate {
            id,
            template: TemplateBuffer::from_definition(&definition, |tag| {
                Key::resolve(
                    lookup.tags.iter().position(|t| t == tag).map(|i| i as u16),
                    tag,
                )
            }),
        }
    }

    /// Mirror with an `li` template (id 1) holding one anchor, and a
    /// `button` template (id 2) with a target span
    fn mirror() -> DomMirror {
        let mut mirror = DomMirror::new();
        let frame = encode_frame(&[
            ServerCommand::InitWindow {
                window_id: WINDOW.into(),
                tables: tables(),
            },
            install(1, TemplateNode::element("li").child(TemplateNode::anchor())),
            install(
                2,
                TemplateNode::element("button").child(TemplateNode::element("span").target()),
            ),
        ])
        .unwrap();
        mirror.receive(&frame).unwrap();
        mirror
    }

    fn apply(mirror: &mut DomMirror, commands: &[ServerCommand]) {
        let frame = encode_frame(commands).unwrap();
        mirror.receive(&frame).unwrap();
    }

    fn text_block(id: BlockId, text: &str) -> [ServerCommand; 2] {
        [
            ServerCommand::InitBlock {
                block: id,
                template: 1,
            },
            ServerCommand::AttachAnchor {
                block: id,
                anchor: 0,
                content: vec![Content::from(text)],
            },
        ]
    }

    #[test]
    fn test_init_window_and_offset() {
        let mut mirror = DomMirror::new();
        let frame = encode_frame(&[ServerCommand::InitWindow {
            window_id: WINDOW.into(),
            tables: tables(),
        }])
        .unwrap();
        mirror.receive(&frame).unwrap();

        assert_eq!(mirror.window_id(), Some(WINDOW));
        assert_eq!(mirror.read_offset(), frame.len() as u64);
    }

    #[test]
    fn test_anchor_swap_uses_one_marker() {
        let mut mirror = mirror();
        let mut commands = Vec::new();
        for (id, text) in [(1, "A"), (2, "B"), (3, "C"), (4, "D"), (5, "E")] {
            commands.extend(text_block(id, text));
        }
        commands.push(ServerCommand::AttachAnchor {
            block: ROOT_BLOCK,
            anchor: 0,
            content: vec![Content::Block(1), Content::Block(2), Content::Block(3)],
        });
        apply(&mut mirror, &commands);
        assert_eq!(mirror.html(), "<li>A</li><li>B</li><li>C</li>");
        assert_eq!(mirror.peak_markers(), 0);

        apply(
            &mut mirror,
            &[ServerCommand::AttachAnchor {
                block: ROOT_BLOCK,
                anchor: 0,
                content: vec![Content::Block(4), Content::Block(5)],
            }],
        );
        assert_eq!(mirror.html(), "<li>D</li><li>E</li>");
        assert_eq!(mirror.peak_markers(), 1);
    }

    #[test]
    fn test_reorder_keeps_nodes() {
        let mut mirror = mirror();
        let mut commands = Vec::new();
        for (id, text) in [(1, "x"), (2, "y")] {
            commands.extend(text_block(id, text));
        }
        commands.push(ServerCommand::AttachAnchor {
            block: ROOT_BLOCK,
            anchor: 0,
            content: vec![Content::Block(1), Content::from("-"), Content::Block(2)],
        });
        commands.push(ServerCommand::AttachAnchor {
            block: ROOT_BLOCK,
            anchor: 0,
            content: vec![Content::Block(2), Content::Block(1)],
        });
        apply(&mut mirror, &commands);
        assert_eq!(mirror.html(), "<li>y</li><li>x</li>");
    }

    #[test]
    fn test_block_moved_between_anchors() {
        let mut mirror = mirror();
        let mut commands = Vec::new();
        for (id, text) in [(1, ""), (2, ""), (3, "item")] {
            commands.extend(text_block(id, text));
        }
        commands.extend([
            ServerCommand::AttachAnchor {
                block: ROOT_BLOCK,
                anchor: 0,
                content: vec![Content::Block(1), Content::Block(2)],
            },
            ServerCommand::AttachAnchor {
                block: 1,
                anchor: 0,
                content: vec![Content::Block(3)],
            },
            ServerCommand::AttachAnchor {
                block: 2,
                anchor: 0,
                content: vec![Content::Block(3)],
            },
            // re-attaching the old anchor must not pull the moved block back out
            ServerCommand::AttachAnchor {
                block: 1,
                anchor: 0,
                content: vec![Content::from("left")],
            },
        ]);
        apply(&mut mirror, &commands);
        assert_eq!(mirror.html(), "<li>left</li><li><li>item</li></li>");
    }

    #[test]
    fn test_element_updates() {
        let mut mirror = mirror();
        apply(
            &mut mirror,
            &[
                ServerCommand::InitBlock {
                    block: 1,
                    template: 2,
                },
                ServerCommand::AttachAnchor {
                    block: ROOT_BLOCK,
                    anchor: 0,
                    content: vec![Content::Block(1)],
                },
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: 0,
                    update: ElementUpdate::SetAttribute {
                        key: Key::Code(1),
                        value: "tip".into(),
                    },
                },
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: ROOT_TARGET,
                    update: ElementUpdate::Style {
                        key: Key::Code(0),
                        value: "red".into(),
                    },
                },
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: ROOT_TARGET,
                    update: ElementUpdate::ToggleClass {
                        name: "on".into(),
                        on: true,
                    },
                },
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: ROOT_TARGET,
                    update: ElementUpdate::Checked(true),
                },
            ],
        );
        assert_eq!(
            mirror.html(),
            "<button class=\"on\" style=\"color:red;\" checked><span title=\"tip\"></span></button>"
        );

        apply(
            &mut mirror,
            &[
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: ROOT_TARGET,
                    update: ElementUpdate::Style {
                        key: Key::Code(0),
                        value: String::new(),
                    },
                },
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: ROOT_TARGET,
                    update: ElementUpdate::ToggleClass {
                        name: "on".into(),
                        on: false,
                    },
                },
                ServerCommand::ElementUpdate {
                    block: 1,
                    target: 0,
                    update: ElementUpdate::RemoveAttribute {
                        key: Key::Inline("title".into()),
                    },
                },
            ],
        );
        assert_eq!(mirror.html(), "<button checked><span></span></button>");
    }

    #[test]
    fn test_events_and_ping() {
        let mut mirror = mirror();
        apply(
            &mut mirror,
            &[
                ServerCommand::InitBlock {
                    block: 1,
                    template: 2,
                },
                ServerCommand::AttachEvent {
                    block: 1,
                    target: ROOT_TARGET,
                    event: 0,
                    handler: 42,
                },
            ],
        );

        assert!(mirror.dispatch(1, ROOT_TARGET, "click", "").unwrap());
        assert!(!mirror.dispatch(1, 0, "click", "").unwrap());
        assert!(!mirror.dispatch(1, ROOT_TARGET, "keydown", "").unwrap());

        apply(&mut mirror, &[ServerCommand::Ping]);
        let offset = mirror.read_offset();

        let outgoing: Vec<_> = mirror
            .take_outgoing()
            .iter()
            .map(|bytes| decode_client_message(bytes).unwrap())
            .collect();
        assert_eq!(
            outgoing,
            vec![
                ClientMessage::Event {
                    handler: 42,
                    data: String::new()
                },
                ClientMessage::Pong {
                    read_offset: offset
                },
            ]
        );
    }

    #[test]
    fn test_remove_blocks_detaches_and_drops_listeners() {
        let mut mirror = mirror();
        let mut commands = text_block(1, "gone").to_vec();
        commands.extend([
            ServerCommand::AttachAnchor {
                block: ROOT_BLOCK,
                anchor: 0,
                content: vec![Content::Block(1)],
            },
            ServerCommand::AttachEvent {
                block: 1,
                target: ROOT_TARGET,
                event: 0,
                handler: 1,
            },
            ServerCommand::AttachAnchor {
                block: ROOT_BLOCK,
                anchor: 0,
                content: vec![],
            },
            ServerCommand::RemoveBlocks { blocks: vec![1] },
        ]);
        apply(&mut mirror, &commands);

        assert_eq!(mirror.html(), "");
        assert_eq!(mirror.block_count(), 0);
        assert_eq!(mirror.listener_count(), 0);
    }

    #[test]
    fn test_arena_reuses_released_nodes() {
        let mut mirror = mirror();
        let baseline = mirror.node_count();
        let mut high_water = 0;
        for round in 0..50u16 {
            let outer = round * 2 + 1;
            let inner = outer + 1;
            let mut commands = text_block(outer, "outer").to_vec();
            commands.extend(text_block(inner, "inner"));
            commands.extend([
                ServerCommand::AttachAnchor {
                    block: outer,
                    anchor: 0,
                    content: vec![Content::from("a"), Content::Block(inner)],
                },
                ServerCommand::AttachAnchor {
                    block: ROOT_BLOCK,
                    anchor: 0,
                    content: vec![Content::Block(outer)],
                },
                ServerCommand::AttachAnchor {
                    block: ROOT_BLOCK,
                    anchor: 0,
                    content: vec![],
                },
                ServerCommand::RemoveBlocks {
                    blocks: vec![outer, inner],
                },
            ]);
            apply(&mut mirror, &commands);
            assert_eq!(mirror.node_count(), baseline);
            high_water = high_water.max(mirror.nodes.len());
        }
        // one round's worth of slots, recycled ever after
        assert!(high_water < baseline + 16, "arena grew to {high_water}");
        assert_eq!(mirror.html(), "");
    }

    #[test]
    fn test_child_block_survives_parent_removal() {
        let mut mirror = mirror();
        let mut commands = text_block(1, "").to_vec();
        commands.extend(text_block(2, "kept"));
        commands.extend([
            ServerCommand::AttachAnchor {
                block: 1,
                anchor: 0,
                content: vec![Content::Block(2)],
            },
            ServerCommand::RemoveBlocks { blocks: vec![1] },
            ServerCommand::AttachAnchor {
                block: ROOT_BLOCK,
                anchor: 0,
                content: vec![Content::Block(2)],
            },
        ]);
        apply(&mut mirror, &commands);
        assert_eq!(mirror.html(), "<li>kept</li>");
    }

    #[test]
    fn test_unknown_references_are_errors() {
        let mut mirror = mirror();
        let frame = encode_frame(&[ServerCommand::InitBlock {
            block: 1,
            template: 99,
        }])
        .unwrap();
        assert_eq!(mirror.receive(&frame), Err(MirrorError::UnknownTemplate(99)));

        let frame = encode_frame(&[ServerCommand::ElementUpdate {
            block: 0,
            target: 3,
            update: ElementUpdate::Checked(true),
        }])
        .unwrap();
        assert_eq!(
            mirror.receive(&frame),
            Err(MirrorError::TargetOutOfRange {
                block: 0,
                target: 3
            })
        );
    }

    #[test]
    fn test_corrupt_frame_does_not_advance_offset() {
        let mut mirror = mirror();
        let before = mirror.read_offset();
        assert!(mirror.receive(&[6, 0, 9, b'/']).is_err());
        assert_eq!(mirror.read_offset(), before);
    }

    #[test]
    fn test_nav_cookies_and_client_functions() {
        let mut mirror = mirror();
        apply(
            &mut mirror,
            &[
                ServerCommand::Nav {
                    path: "/about".into(),
                },
                ServerCommand::ClientDataSet {
                    cookie: "sid=1".into(),
                    expiration: 60,
                },
                ServerCommand::InstallClientFunction {
                    id: 3,
                    function: ClientFunction {
                        arg_names: vec!["x".into()],
                        body: "return x".into(),
                    },
                },
                ServerCommand::RunClientFunction {
                    id: 3,
                    args: vec![serde_json::json!("hi")],
                },
            ],
        );
        assert_eq!(mirror.history(), &["/about".to_string()]);
        assert_eq!(mirror.cookies(), &[("sid=1".to_string(), 60)]);
        assert_eq!(mirror.function_calls().len(), 1);

        let frame = encode_frame(&[ServerCommand::RunClientFunction {
            id: 4,
            args: vec![],
        }])
        .unwrap();
        assert_eq!(mirror.receive(&frame), Err(MirrorError::UnknownFunction(4)));
    }
}
