//! Build output read at startup
//!
//! The build step leaves these files in one directory:
//!
//! | File | Required | Contents |
//! |---|---|---|
//! | `bootstrap.html` | yes | page that loads the client runtime |
//! | `bootstrap.html.br`, `bootstrap.html.gz` | no | pre-compressed variants |
//! | `styles.css` | no | global stylesheet |
//! | `templates.bin` | no | a frame of INSTALL_TEMPLATE commands |
//! | `interning.json` | no | names to pre-intern, by table |
//!
//! Everything except the interning index and templates is served as-is.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tendril_core::{
    BlockDefinition, InstallStep, InternTables, StepKind, StepRole, TableKind, TemplateNode,
};
use tendril_protocol::command::{Key, TemplateBuffer, WireNode};
use tendril_protocol::{decode_frame, ServerCommand};

use crate::view::SharedState;

/// The reverse string-interning index written by the build
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InterningIndex {
    pub tags: Vec<String>,
    pub attributes: Vec<String>,
    pub styles: Vec<String>,
    pub events: Vec<String>,
}

impl InterningIndex {
    /// Intern every name, in order, into `tables`
    pub fn seed(&self, tables: &InternTables) {
        tables.seed(TableKind::Tags, self.tags.iter().map(String::as_str));
        tables.seed(TableKind::Attributes, self.attributes.iter().map(String::as_str));
        tables.seed(TableKind::Styles, self.styles.iter().map(String::as_str));
        tables.seed(TableKind::Events, self.events.iter().map(String::as_str));
    }
}

/// HTTP content coding of a bootstrap variant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    Brotli,
    Gzip,
    Identity,
}

impl ContentEncoding {
    /// Value for the `Content-Encoding` header, if any
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            ContentEncoding::Brotli => Some("br"),
            ContentEncoding::Gzip => Some("gzip"),
            ContentEncoding::Identity => None,
        }
    }
}

/// Opaque blobs produced by the build
#[derive(Clone, Debug, Default)]
pub struct BuildArtifacts {
    pub bootstrap: Bytes,
    pub bootstrap_br: Option<Bytes>,
    pub bootstrap_gz: Option<Bytes>,
    pub styles: Option<Bytes>,
    pub templates: Option<Bytes>,
    pub interning: InterningIndex,
}

fn read_optional(path: &Path) -> Result<Option<Bytes>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(Bytes::from(data)))
}

impl BuildArtifacts {
    /// Read the build output in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let bootstrap_path = dir.join("bootstrap.html");
        if !bootstrap_path.exists() {
            bail!("No bootstrap.html found in {}. Run the build first.", dir.display());
        }
        let bootstrap = fs::read(&bootstrap_path)
            .with_context(|| format!("Failed to read {}", bootstrap_path.display()))?;

        let interning = match read_optional(&dir.join("interning.json"))? {
            Some(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse {}", dir.join("interning.json").display()))?,
            None => InterningIndex::default(),
        };

        let artifacts = Self {
            bootstrap: Bytes::from(bootstrap),
            bootstrap_br: read_optional(&dir.join("bootstrap.html.br"))?,
            bootstrap_gz: read_optional(&dir.join("bootstrap.html.gz"))?,
            styles: read_optional(&dir.join("styles.css"))?,
            templates: read_optional(&dir.join("templates.bin"))?,
            interning,
        };
        tracing::info!(
            dir = %dir.display(),
            brotli = artifacts.bootstrap_br.is_some(),
            gzip = artifacts.bootstrap_gz.is_some(),
            templates = artifacts.templates.as_ref().map(Bytes::len).unwrap_or(0),
            "build artifacts loaded"
        );
        Ok(artifacts)
    }

    /// Pick the best bootstrap variant for an `Accept-Encoding` header
    ///
    /// Brotli is preferred over gzip over identity; codings with `q=0` are
    /// never picked.
    pub fn bootstrap_for(&self, accept_encoding: Option<&str>) -> (ContentEncoding, Bytes) {
        let accepted = |coding: &str| {
            accept_encoding
                .unwrap_or_default()
                .split(',')
                .filter_map(|item| {
                    let mut parts = item.split(';').map(str::trim);
                    let name = parts.next()?;
                    let quality = parts
                        .find_map(|param| param.strip_prefix("q="))
                        .and_then(|q| q.parse::<f32>().ok())
                        .unwrap_or(1.0);
                    Some((name, quality))
                })
                .any(|(name, quality)| (name == coding || name == "*") && quality > 0.0)
        };

        if let Some(br) = self.bootstrap_br.as_ref().filter(|_| accepted("br")) {
            return (ContentEncoding::Brotli, br.clone());
        }
        if let Some(gz) = self.bootstrap_gz.as_ref().filter(|_| accepted("gzip")) {
            return (ContentEncoding::Gzip, gz.clone());
        }
        (ContentEncoding::Identity, self.bootstrap.clone())
    }

    /// Block definitions compiled into `templates.bin`
    pub fn definitions(&self) -> Result<Vec<BlockDefinition>> {
        let Some(templates) = &self.templates else {
            return Ok(Vec::new());
        };
        let commands = decode_frame(templates).context("Failed to decode templates.bin")?;

        let mut definitions = Vec::with_capacity(commands.len());
        for command in commands {
            let ServerCommand::InstallTemplate { id, template } = command else {
                bail!("templates.bin holds a {:?} command", command.opcode());
            };
            definitions.push(self.definition(id, &template)?);
        }
        Ok(definitions)
    }

    fn definition(&self, id: u16, template: &TemplateBuffer) -> Result<BlockDefinition> {
        let mut root = self.lift(&template.root)?;
        mark_targets(&mut root, &template.script)
            .with_context(|| format!("template {id}: install script does not fit its tree"))?;

        let definition = BlockDefinition::new(id, root)?;
        if definition.script() != template.script.as_slice() {
            bail!("template {id}: install script differs from the compiled one");
        }
        Ok(definition)
    }

    fn lift(&self, node: &WireNode) -> Result<TemplateNode> {
        Ok(match node {
            WireNode::Element {
                tag,
                attributes,
                children,
            } => {
                let tag = match tag {
                    Key::Inline(name) => name.clone(),
                    Key::Code(code) => self
                        .interning
                        .tags
                        .get(*code as usize)
                        .cloned()
                        .with_context(|| format!("tag code {code} missing from interning.json"))?,
                };
                TemplateNode::Element {
                    tag,
                    attributes: attributes.clone(),
                    children: children.iter().map(|child| self.lift(child)).collect::<Result<_>>()?,
                    target: false,
                }
            }
            WireNode::Text(text) => TemplateNode::Text(text.clone()),
            WireNode::Anchor => TemplateNode::Anchor,
        })
    }

    /// Seed the shared tables and install every definition
    pub fn install(&self, shared: &SharedState) -> Result<usize> {
        self.interning.seed(&shared.tables);
        let definitions = self.definitions()?;
        let count = definitions.len();
        for definition in definitions {
            shared.definitions.install(definition)?;
        }
        tracing::debug!(count, "template definitions installed");
        Ok(count)
    }
}

/// Follow the install script and flag the elements it registers as targets
fn mark_targets(root: &mut TemplateNode, script: &[InstallStep]) -> Result<()> {
    // reference n is a child-index path from the root
    let mut references: Vec<Vec<usize>> = vec![Vec::new()];
    for step in script {
        let mut path = references
            .get(step.from as usize)
            .cloned()
            .with_context(|| format!("step refers to unknown reference {}", step.from))?;
        match step.kind {
            StepKind::FirstChild => path.push(0),
            StepKind::NextSibling => match path.last_mut() {
                Some(last) => *last += 1,
                None => bail!("the root has no siblings"),
            },
        }

        let node = node_at(root, &path).context("step leaves the template")?;
        if step.role == StepRole::Target {
            match node {
                TemplateNode::Element { target, .. } => *target = true,
                _ => bail!("target step lands on a non-element"),
            }
        }
        references.push(path);
    }
    Ok(())
}

fn node_at<'a>(root: &'a mut TemplateNode, path: &[usize]) -> Option<&'a mut TemplateNode> {
    let mut node = root;
    for &index in path {
        node = match node {
            TemplateNode::Element { children, .. } => children.get_mut(index)?,
            _ => return None,
        };
    }
    Some(node)
}
