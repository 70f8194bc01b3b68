//! Block model
//!
//! A [`BlockDefinition`] is a static template plus an install script. The
//! script is a list of `firstChild`/`nextSibling` steps that, replayed on a
//! fresh clone of the template, materialize every target element and anchor
//! placeholder without walking the rest of the tree.
//!
//! A [`BlockRegistry`] tracks the live instantiations of definitions for one
//! window: which ids are in use, what each anchor currently holds, and which
//! blocks were dropped by an attach and must be released.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeSet;

use crate::error::{BlockError, Result};

/// Compiler-assigned definition id
pub type TemplateId = u16;

/// Session-unique block id
pub type BlockId = u16;

/// The implicit block that owns the document mount point
pub const ROOT_BLOCK: BlockId = 0;

/// Reserved target address for a block's root element
pub const ROOT_TARGET: u8 = 255;

/// Highest block id that can be instantiated
///
/// Block references in ATTACH_ANCHOR carry 15 bits and `0xFFFF` terminates the
/// list, so `0x7FFF` is never handed out.
pub const MAX_BLOCK_ID: BlockId = 0x7FFE;

/// Largest text item representable in one ATTACH_ANCHOR entry
pub const MAX_TEXT_ITEM: usize = 0x7FFF;

const MAX_STEPS: usize = 255;
const MAX_TARGETS: usize = 255;
const MAX_ANCHORS: usize = 255;

/// A node of a static template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateNode {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
        children: Vec<TemplateNode>,
        /// Whether the element is addressable as a target
        target: bool,
    },
    Text(String),
    /// Insertion point for dynamic content
    Anchor,
}

impl TemplateNode {
    pub fn element(tag: impl Into<String>) -> Self {
        TemplateNode::Element {
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            target: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        TemplateNode::Text(text.into())
    }

    pub fn anchor() -> Self {
        TemplateNode::Anchor
    }

    /// Add a static attribute (elements only)
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let TemplateNode::Element { attributes, .. } = &mut self {
            attributes.push((name.into(), value.into()));
        }
        self
    }

    /// Append a child (elements only)
    pub fn child(mut self, child: TemplateNode) -> Self {
        if let TemplateNode::Element { children, .. } = &mut self {
            children.push(child);
        }
        self
    }

    pub fn children(mut self, nodes: impl IntoIterator<Item = TemplateNode>) -> Self {
        if let TemplateNode::Element { children, .. } = &mut self {
            children.extend(nodes);
        }
        self
    }

    /// Mark this element as a target
    pub fn target(mut self) -> Self {
        if let TemplateNode::Element { target, .. } = &mut self {
            *target = true;
        }
        self
    }

    /// Whether this node or anything below it needs a reference
    fn has_marks(&self) -> bool {
        match self {
            TemplateNode::Element {
                children, target, ..
            } => *target || children.iter().any(TemplateNode::has_marks),
            TemplateNode::Text(_) => false,
            TemplateNode::Anchor => true,
        }
    }

    fn role(&self) -> StepRole {
        match self {
            TemplateNode::Element { target: true, .. } => StepRole::Target,
            TemplateNode::Anchor => StepRole::Anchor,
            _ => StepRole::Path,
        }
    }
}

/// Traversal direction of an install step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepKind {
    FirstChild = 0,
    NextSibling = 1,
}

impl StepKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StepKind::FirstChild),
            1 => Some(StepKind::NextSibling),
            _ => None,
        }
    }
}

/// What the reference produced by a step is registered as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepRole {
    /// Intermediate node on the way to a target or anchor
    Path = 0,
    Target = 1,
    Anchor = 2,
}

impl StepRole {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StepRole::Path),
            1 => Some(StepRole::Target),
            2 => Some(StepRole::Anchor),
            _ => None,
        }
    }
}

/// One step of an install script
///
/// Reference 0 is the cloned root; step `n` produces reference `n + 1` by
/// moving from reference `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallStep {
    pub kind: StepKind,
    pub from: u8,
    pub role: StepRole,
}

/// An immutable, compiled block template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDefinition {
    id: TemplateId,
    root: TemplateNode,
    script: Vec<InstallStep>,
    target_count: usize,
    anchor_count: usize,
}

impl BlockDefinition {
    /// Compile a template into a definition
    ///
    /// The root must be an element; its own target mark is ignored since
    /// [`ROOT_TARGET`] always addresses it.
    pub fn new(id: TemplateId, root: TemplateNode) -> Result<Self> {
        let TemplateNode::Element { children, .. } = &root else {
            return Err(BlockError::InvalidRoot(id));
        };

        let mut compiler = ScriptCompiler::default();
        compiler.walk_children(0, children)?;

        Ok(Self {
            id,
            root,
            script: compiler.steps,
            target_count: compiler.targets,
            anchor_count: compiler.anchors,
        })
    }

    pub fn id(&self) -> TemplateId {
        self.id
    }

    pub fn root(&self) -> &TemplateNode {
        &self.root
    }

    pub fn script(&self) -> &[InstallStep] {
        &self.script
    }

    pub fn target_count(&self) -> usize {
        self.target_count
    }

    pub fn anchor_count(&self) -> usize {
        self.anchor_count
    }
}

#[derive(Default)]
struct ScriptCompiler {
    steps: Vec<InstallStep>,
    targets: usize,
    anchors: usize,
}

impl ScriptCompiler {
    fn push(&mut self, kind: StepKind, from: u8, role: StepRole) -> Result<u8> {
        if self.steps.len() >= MAX_STEPS {
            return Err(BlockError::TemplateTooLarge {
                what: "install steps",
                max: MAX_STEPS,
            });
        }
        match role {
            StepRole::Target if self.targets >= MAX_TARGETS => {
                return Err(BlockError::TemplateTooLarge {
                    what: "targets",
                    max: MAX_TARGETS,
                })
            }
            StepRole::Anchor if self.anchors >= MAX_ANCHORS => {
                return Err(BlockError::TemplateTooLarge {
                    what: "anchors",
                    max: MAX_ANCHORS,
                })
            }
            StepRole::Target => self.targets += 1,
            StepRole::Anchor => self.anchors += 1,
            StepRole::Path => {}
        }
        self.steps.push(InstallStep { kind, from, role });
        // at most 255 steps, so the new reference fits in a u8
        Ok(self.steps.len() as u8)
    }

    /// Emit steps for the children of the node held in `parent`
    fn walk_children(&mut self, parent: u8, children: &[TemplateNode]) -> Result<()> {
        // last materialized sibling: (child index, reference)
        let mut cursor: Option<(usize, u8)> = None;

        for (index, child) in children.iter().enumerate() {
            if !child.has_marks() {
                continue;
            }

            let mut reference = match cursor {
                Some((at, reference)) => (at, reference),
                None => (
                    0,
                    self.push(
                        StepKind::FirstChild,
                        parent,
                        if index == 0 { child.role() } else { StepRole::Path },
                    )?,
                ),
            };
            while reference.0 < index {
                let role = if reference.0 + 1 == index {
                    child.role()
                } else {
                    StepRole::Path
                };
                reference = (reference.0 + 1, self.push(StepKind::NextSibling, reference.1, role)?);
            }
            cursor = Some(reference);

            if let TemplateNode::Element { children, .. } = child {
                if children.iter().any(TemplateNode::has_marks) {
                    self.walk_children(reference.1, children)?;
                }
            }
        }
        Ok(())
    }
}

/// One item of an anchor's content list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Block(BlockId),
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<BlockId> for Content {
    fn from(id: BlockId) -> Self {
        Content::Block(id)
    }
}

#[derive(Debug)]
struct BlockEntry {
    template: Option<TemplateId>,
    anchors: SmallVec<[Vec<Content>; 2]>,
    target_count: usize,
    /// Anchor this block is currently attached to
    parent: Option<(BlockId, u8)>,
}

/// Live blocks of one window
#[derive(Debug)]
pub struct BlockRegistry {
    blocks: FxHashMap<BlockId, BlockEntry>,
    free: BTreeSet<BlockId>,
    next_id: BlockId,
    /// Blocks that may have lost their parent since the last collection
    orphans: Vec<BlockId>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        let mut blocks = FxHashMap::default();
        blocks.insert(
            ROOT_BLOCK,
            BlockEntry {
                template: None,
                anchors: SmallVec::from_elem(Vec::new(), 1),
                target_count: 0,
                parent: None,
            },
        );
        Self {
            blocks,
            free: BTreeSet::new(),
            next_id: 1,
            orphans: Vec::new(),
        }
    }

    /// Allocate a block id for a new instance of `definition`
    ///
    /// The block starts detached and is released at the next
    /// [`collect_released`](Self::collect_released) unless attached first.
    pub fn instantiate(&mut self, definition: &BlockDefinition) -> Result<BlockId> {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None if self.next_id <= MAX_BLOCK_ID => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
            None => return Err(BlockError::IdsExhausted),
        };

        self.blocks.insert(
            id,
            BlockEntry {
                template: Some(definition.id()),
                anchors: SmallVec::from_elem(Vec::new(), definition.anchor_count()),
                target_count: definition.target_count(),
                parent: None,
            },
        );
        self.orphans.push(id);
        tracing::trace!(block = id, template = definition.id(), "block instantiated");
        Ok(id)
    }

    /// Replace the content of an anchor
    ///
    /// Blocks in `content` that were attached elsewhere are moved here; blocks
    /// that were in the anchor and are not in `content` become orphans.
    pub fn attach(&mut self, block: BlockId, anchor: u8, content: Vec<Content>) -> Result<()> {
        let entry = self
            .blocks
            .get(&block)
            .ok_or(BlockError::UnknownBlock(block))?;
        if usize::from(anchor) >= entry.anchors.len() {
            return Err(BlockError::AnchorOutOfRange { block, anchor });
        }

        let mut seen = BTreeSet::new();
        for item in &content {
            let Content::Block(child) = item else {
                continue;
            };
            if !self.blocks.contains_key(child) {
                return Err(BlockError::UnknownBlock(*child));
            }
            if !seen.insert(*child) {
                return Err(BlockError::DuplicateContent(*child));
            }
            if *child == ROOT_BLOCK || self.is_ancestor_or_self(*child, block) {
                return Err(BlockError::CyclicAttach(*child));
            }
        }

        let previous = match self.blocks.get_mut(&block) {
            Some(entry) => std::mem::take(&mut entry.anchors[usize::from(anchor)]),
            None => return Err(BlockError::UnknownBlock(block)),
        };
        for item in previous {
            if let Content::Block(old) = item {
                if let Some(entry) = self.blocks.get_mut(&old) {
                    entry.parent = None;
                }
                self.orphans.push(old);
            }
        }

        for child in &seen {
            let moved_from = self.blocks.get(child).and_then(|entry| entry.parent);
            if let Some((old_block, old_anchor)) = moved_from {
                if let Some(old) = self.blocks.get_mut(&old_block) {
                    if let Some(list) = old.anchors.get_mut(usize::from(old_anchor)) {
                        list.retain(|item| item != &Content::Block(*child));
                    }
                }
            }
            if let Some(entry) = self.blocks.get_mut(child) {
                entry.parent = Some((block, anchor));
            }
        }

        if let Some(entry) = self.blocks.get_mut(&block) {
            entry.anchors[usize::from(anchor)] = content;
        }
        Ok(())
    }

    fn is_ancestor_or_self(&self, candidate: BlockId, mut block: BlockId) -> bool {
        loop {
            if block == candidate {
                return true;
            }
            match self.blocks.get(&block).and_then(|entry| entry.parent) {
                Some((parent, _)) => block = parent,
                None => return false,
            }
        }
    }

    /// Release every detached block, with everything attached beneath it
    ///
    /// Returns the released ids, parents before children. Their ids are free
    /// for reuse.
    pub fn collect_released(&mut self) -> Vec<BlockId> {
        let mut released = Vec::new();
        let orphans = std::mem::take(&mut self.orphans);
        for id in orphans {
            let detached = self
                .blocks
                .get(&id)
                .map(|entry| entry.parent.is_none())
                .unwrap_or(false);
            if id != ROOT_BLOCK && detached {
                self.release(id, &mut released);
            }
        }
        if !released.is_empty() {
            tracing::trace!(count = released.len(), "blocks released");
        }
        released
    }

    fn release(&mut self, id: BlockId, released: &mut Vec<BlockId>) {
        let Some(entry) = self.blocks.remove(&id) else {
            return;
        };
        released.push(id);
        self.free.insert(id);
        for content in entry.anchors {
            for item in content {
                if let Content::Block(child) = item {
                    self.release(child, released);
                }
            }
        }
    }

    /// Check that `target` addresses an element of `block`
    pub fn check_target(&self, block: BlockId, target: u8) -> Result<()> {
        let entry = self
            .blocks
            .get(&block)
            .ok_or(BlockError::UnknownBlock(block))?;
        if target == ROOT_TARGET || usize::from(target) < entry.target_count {
            Ok(())
        } else {
            Err(BlockError::TargetOutOfRange { block, target })
        }
    }

    pub fn anchor_content(&self, block: BlockId, anchor: u8) -> Option<&[Content]> {
        self.blocks
            .get(&block)
            .and_then(|entry| entry.anchors.get(usize::from(anchor)))
            .map(Vec::as_slice)
    }

    pub fn parent_of(&self, block: BlockId) -> Option<(BlockId, u8)> {
        self.blocks.get(&block).and_then(|entry| entry.parent)
    }

    pub fn template_of(&self, block: BlockId) -> Option<TemplateId> {
        self.blocks.get(&block).and_then(|entry| entry.template)
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains_key(&block)
    }

    /// Number of live blocks, not counting the root block
    pub fn len(&self) -> usize {
        self.blocks.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_item() -> BlockDefinition {
        BlockDefinition::new(
            7,
            TemplateNode::element("li").child(TemplateNode::anchor()),
        )
        .unwrap()
    }

    #[test]
    fn test_script_reaches_marked_nodes_only() {
        // <div><h1>title</h1><p>static</p><button*>go</button><ul><!--a--></ul></div>
        let root = TemplateNode::element("div")
            .child(TemplateNode::element("h1").child(TemplateNode::text("title")))
            .child(TemplateNode::element("p").child(TemplateNode::text("static")))
            .child(
                TemplateNode::element("button")
                    .target()
                    .child(TemplateNode::text("go")),
            )
            .child(TemplateNode::element("ul").child(TemplateNode::anchor()));
        let def = BlockDefinition::new(1, root).unwrap();

        use StepKind::*;
        use StepRole::*;
        let expected = [
            (FirstChild, 0, Path),   // ref 1: h1
            (NextSibling, 1, Path),  // ref 2: p
            (NextSibling, 2, Target), // ref 3: button
            (NextSibling, 3, Path),  // ref 4: ul
            (FirstChild, 4, Anchor), // ref 5: anchor
        ];
        let script: Vec<_> = def
            .script()
            .iter()
            .map(|step| (step.kind, step.from, step.role))
            .collect();
        assert_eq!(script, expected);
        assert_eq!(def.target_count(), 1);
        assert_eq!(def.anchor_count(), 1);
    }

    #[test]
    fn test_targets_numbered_in_document_order() {
        let root = TemplateNode::element("form")
            .target()
            .child(TemplateNode::element("input").target())
            .child(
                TemplateNode::element("div")
                    .child(TemplateNode::element("span").target())
                    .child(TemplateNode::anchor()),
            )
            .child(TemplateNode::element("input").target());
        let def = BlockDefinition::new(2, root).unwrap();

        let roles: Vec<_> = def.script().iter().map(|step| step.role).collect();
        assert_eq!(
            roles,
            vec![
                StepRole::Target,
                StepRole::Path,
                StepRole::Target,
                StepRole::Anchor,
                StepRole::Target,
            ]
        );
        // root's own mark is not counted
        assert_eq!(def.target_count(), 3);
    }

    #[test]
    fn test_root_must_be_element() {
        assert_eq!(
            BlockDefinition::new(3, TemplateNode::text("bare")),
            Err(BlockError::InvalidRoot(3))
        );
    }

    #[test]
    fn test_too_many_targets_rejected() {
        let root = TemplateNode::element("div")
            .children((0..300).map(|_| TemplateNode::element("i").target()));
        assert!(matches!(
            BlockDefinition::new(4, root),
            Err(BlockError::TemplateTooLarge { .. })
        ));
    }

    #[test]
    fn test_ids_reused_lowest_first() {
        let def = list_item();
        let mut registry = BlockRegistry::new();

        let a = registry.instantiate(&def).unwrap();
        let b = registry.instantiate(&def).unwrap();
        let c = registry.instantiate(&def).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        registry.attach(ROOT_BLOCK, 0, vec![Content::Block(b)]).unwrap();
        let mut released = registry.collect_released();
        released.sort_unstable();
        assert_eq!(released, vec![1, 3]);

        assert_eq!(registry.instantiate(&def).unwrap(), 1);
        assert_eq!(registry.instantiate(&def).unwrap(), 3);
        assert_eq!(registry.instantiate(&def).unwrap(), 4);
    }

    #[test]
    fn test_replaced_content_released_with_descendants() {
        let def = list_item();
        let mut registry = BlockRegistry::new();

        let outer = registry.instantiate(&def).unwrap();
        let inner = registry.instantiate(&def).unwrap();
        registry.attach(outer, 0, vec![Content::Block(inner)]).unwrap();
        registry
            .attach(ROOT_BLOCK, 0, vec![Content::Block(outer)])
            .unwrap();
        assert!(registry.collect_released().is_empty());
        assert_eq!(registry.len(), 2);

        registry
            .attach(ROOT_BLOCK, 0, vec![Content::from("empty")])
            .unwrap();
        assert_eq!(registry.collect_released(), vec![outer, inner]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_attach_moves_block_between_anchors() {
        let def = list_item();
        let mut registry = BlockRegistry::new();

        let left = registry.instantiate(&def).unwrap();
        let right = registry.instantiate(&def).unwrap();
        let item = registry.instantiate(&def).unwrap();
        registry
            .attach(ROOT_BLOCK, 0, vec![left.into(), right.into()])
            .unwrap();
        registry.attach(left, 0, vec![item.into()]).unwrap();
        registry.attach(right, 0, vec![item.into()]).unwrap();

        assert_eq!(registry.anchor_content(left, 0), Some(&[][..]));
        assert_eq!(registry.parent_of(item), Some((right, 0)));
        assert!(registry.collect_released().is_empty());
    }

    #[test]
    fn test_reattached_block_survives_collection() {
        let def = list_item();
        let mut registry = BlockRegistry::new();

        let item = registry.instantiate(&def).unwrap();
        registry.attach(ROOT_BLOCK, 0, vec![item.into()]).unwrap();
        registry.attach(ROOT_BLOCK, 0, vec![]).unwrap();
        registry.attach(ROOT_BLOCK, 0, vec![item.into()]).unwrap();

        assert!(registry.collect_released().is_empty());
        assert!(registry.contains(item));
    }

    #[test]
    fn test_attach_rejects_cycles_and_duplicates() {
        let def = list_item();
        let mut registry = BlockRegistry::new();

        let outer = registry.instantiate(&def).unwrap();
        let inner = registry.instantiate(&def).unwrap();
        registry.attach(outer, 0, vec![inner.into()]).unwrap();

        assert_eq!(
            registry.attach(inner, 0, vec![outer.into()]),
            Err(BlockError::CyclicAttach(outer))
        );
        assert_eq!(
            registry.attach(outer, 0, vec![outer.into()]),
            Err(BlockError::CyclicAttach(outer))
        );
        assert_eq!(
            registry.attach(ROOT_BLOCK, 0, vec![inner.into(), inner.into()]),
            Err(BlockError::DuplicateContent(inner))
        );
        assert_eq!(
            registry.attach(outer, 1, vec![]),
            Err(BlockError::AnchorOutOfRange {
                block: outer,
                anchor: 1
            })
        );
    }

    #[test]
    fn test_check_target() {
        let def = BlockDefinition::new(
            9,
            TemplateNode::element("label").child(TemplateNode::element("input").target()),
        )
        .unwrap();
        let mut registry = BlockRegistry::new();
        let id = registry.instantiate(&def).unwrap();

        assert!(registry.check_target(id, 0).is_ok());
        assert!(registry.check_target(id, ROOT_TARGET).is_ok());
        assert_eq!(
            registry.check_target(id, 1),
            Err(BlockError::TargetOutOfRange {
                block: id,
                target: 1
            })
        );
        assert_eq!(
            registry.check_target(500, 0),
            Err(BlockError::UnknownBlock(500))
        );
    }

    #[test]
    fn test_id_space_exhaustion() {
        let def = list_item();
        let mut registry = BlockRegistry::new();
        for _ in 1..=MAX_BLOCK_ID {
            registry.instantiate(&def).unwrap();
        }
        assert_eq!(registry.instantiate(&def), Err(BlockError::IdsExhausted));
    }
}
