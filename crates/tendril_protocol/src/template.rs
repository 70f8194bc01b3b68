//! INSTALL_TEMPLATE buffer codec
//!
//! ```text
//! node    := 0x01 key(tag) attrCount:u8 (str16 name, str16 value)* childCount:u16 node*
//!          | 0x02 str16
//!          | 0x03
//! buffer  := node stepCount:u8 (kind:u8 from:u8 role:u8)*
//! ```

use bytes::{BufMut, BytesMut};
use tendril_core::{InstallStep, StepKind, StepRole};

use crate::command::{TemplateBuffer, WireNode};
use crate::decode::ByteReader;
use crate::encode::{put_key, put_str16};
use crate::error::{ProtocolError, Result};
use crate::opcode::{NODE_ANCHOR, NODE_ELEMENT, NODE_TEXT};

/// Deepest node nesting a template may have; the root sits at depth 0
pub const MAX_TEMPLATE_DEPTH: usize = 128;

fn too_long(field: &'static str, len: usize, max: usize) -> ProtocolError {
    ProtocolError::FieldTooLong { field, len, max }
}

fn put_node(buf: &mut BytesMut, node: &WireNode, depth: usize) -> Result<()> {
    if depth > MAX_TEMPLATE_DEPTH {
        return Err(too_long("template depth", depth, MAX_TEMPLATE_DEPTH));
    }
    match node {
        WireNode::Element {
            tag,
            attributes,
            children,
        } => {
            buf.put_u8(NODE_ELEMENT);
            put_key(buf, "tag", tag)?;
            let attr_count = u8::try_from(attributes.len())
                .map_err(|_| too_long("attributes", attributes.len(), u8::MAX as usize))?;
            buf.put_u8(attr_count);
            for (name, value) in attributes {
                put_str16(buf, "attribute name", name)?;
                put_str16(buf, "attribute value", value)?;
            }
            let child_count = u16::try_from(children.len())
                .map_err(|_| too_long("children", children.len(), u16::MAX as usize))?;
            buf.put_u16(child_count);
            for child in children {
                put_node(buf, child, depth + 1)?;
            }
        }
        WireNode::Text(text) => {
            buf.put_u8(NODE_TEXT);
            put_str16(buf, "template text", text)?;
        }
        WireNode::Anchor => buf.put_u8(NODE_ANCHOR),
    }
    Ok(())
}

/// Write the body of an INSTALL_TEMPLATE buffer
pub fn encode_template(buf: &mut BytesMut, template: &TemplateBuffer) -> Result<()> {
    put_node(buf, &template.root, 0)?;
    let steps = u8::try_from(template.script.len())
        .map_err(|_| too_long("install script", template.script.len(), u8::MAX as usize))?;
    buf.put_u8(steps);
    for step in &template.script {
        buf.put_u8(step.kind as u8);
        buf.put_u8(step.from);
        buf.put_u8(step.role as u8);
    }
    Ok(())
}

fn read_node(reader: &mut ByteReader<'_>, depth: usize) -> Result<WireNode> {
    if depth > MAX_TEMPLATE_DEPTH {
        return Err(ProtocolError::InvalidTemplate("nodes nested too deep"));
    }
    match reader.u8()? {
        NODE_ELEMENT => {
            let tag = reader.key()?;
            let attr_count = reader.u8()?;
            let attributes = (0..attr_count)
                .map(|_| -> Result<(String, String)> { Ok((reader.str16()?, reader.str16()?)) })
                .collect::<Result<Vec<_>>>()?;
            let child_count = reader.u16()?;
            let children = (0..child_count)
                .map(|_| read_node(reader, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            Ok(WireNode::Element {
                tag,
                attributes,
                children,
            })
        }
        NODE_TEXT => reader.str16().map(WireNode::Text),
        NODE_ANCHOR => Ok(WireNode::Anchor),
        _ => Err(ProtocolError::InvalidTemplate("unknown node tag")),
    }
}

/// Read the body of an INSTALL_TEMPLATE buffer
pub fn decode_template(reader: &mut ByteReader<'_>) -> Result<TemplateBuffer> {
    let root = read_node(reader, 0)?;
    if !matches!(root, WireNode::Element { .. }) {
        return Err(ProtocolError::InvalidTemplate("root is not an element"));
    }

    let count = reader.u8()?;
    let mut script = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        let kind = StepKind::from_u8(reader.u8()?)
            .ok_or(ProtocolError::InvalidTemplate("unknown step kind"))?;
        let from = reader.u8()?;
        let role = StepRole::from_u8(reader.u8()?)
            .ok_or(ProtocolError::InvalidTemplate("unknown step role"))?;
        // references are produced in order; a step may only start from an earlier one
        if from > index {
            return Err(ProtocolError::InvalidTemplate("step refers forward"));
        }
        script.push(InstallStep { kind, from, role });
    }
    Ok(TemplateBuffer { root, script })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Key;
    use tendril_core::{BlockDefinition, TemplateNode};

    #[test]
    fn test_definition_lowering_round_trip() {
        let definition = BlockDefinition::new(
            5,
            TemplateNode::element("ul")
                .attr("class", "todo-list")
                .child(
                    TemplateNode::element("li")
                        .target()
                        .child(TemplateNode::text("first")),
                )
                .child(TemplateNode::anchor()),
        )
        .unwrap();
        let template = TemplateBuffer::from_definition(&definition, |tag| match tag {
            "ul" => Key::Code(8),
            other => Key::Inline(other.to_string()),
        });

        let mut buf = BytesMut::new();
        encode_template(&mut buf, &template).unwrap();
        let mut reader = ByteReader::new(&buf);
        let decoded = decode_template(&mut reader).unwrap();
        reader.finish().unwrap();

        assert_eq!(decoded, template);
        assert_eq!(decoded.script, definition.script());
        let WireNode::Element { tag, children, .. } = &decoded.root else {
            panic!("root is an element");
        };
        assert_eq!(tag, &Key::Code(8));
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_forward_reference_rejected() {
        // <b></b> with one step starting from reference 1
        let bytes = [NODE_ELEMENT, 0, 1, 0, 0, 0, 1, 0, 1, 0];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(
            decode_template(&mut reader),
            Err(ProtocolError::InvalidTemplate("step refers forward"))
        );
    }

    #[test]
    fn test_text_root_rejected() {
        let bytes = [NODE_TEXT, 0, 0, 0];
        let mut reader = ByteReader::new(&bytes);
        assert!(decode_template(&mut reader).is_err());
    }

    fn nested(depth: usize) -> Vec<u8> {
        // <b> with one child, repeated, closed by an anchor and an empty script
        let mut bytes = Vec::new();
        for _ in 0..depth {
            bytes.extend_from_slice(&[NODE_ELEMENT, 0, 1, 0, 0, 1]);
        }
        bytes.extend_from_slice(&[NODE_ANCHOR, 0]);
        bytes
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        let bytes = nested(MAX_TEMPLATE_DEPTH);
        let mut reader = ByteReader::new(&bytes);
        assert!(decode_template(&mut reader).is_ok());
        reader.finish().unwrap();

        for depth in [MAX_TEMPLATE_DEPTH + 1, 100_000] {
            let bytes = nested(depth);
            let mut reader = ByteReader::new(&bytes);
            assert_eq!(
                decode_template(&mut reader),
                Err(ProtocolError::InvalidTemplate("nodes nested too deep"))
            );
        }
    }

    #[test]
    fn test_encoding_refuses_deep_templates() {
        let mut root = WireNode::Anchor;
        for _ in 0..=MAX_TEMPLATE_DEPTH {
            root = WireNode::Element {
                tag: Key::Code(1),
                attributes: Vec::new(),
                children: vec![root],
            };
        }
        let template = TemplateBuffer {
            root,
            script: Vec::new(),
        };
        assert!(matches!(
            encode_template(&mut BytesMut::new(), &template),
            Err(ProtocolError::FieldTooLong { field: "template depth", .. })
        ));
    }
}
