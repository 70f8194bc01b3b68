//! Binary encoder
//!
//! Every integer is big-endian and every string is UTF-8 behind a `u16` byte
//! length. A command that fails to encode leaves the buffer untouched.

use bytes::{BufMut, Bytes, BytesMut};
use tendril_core::{Content, INLINE_KEY, MAX_BLOCK_ID, MAX_TEXT_ITEM};

use crate::command::{ClientMessage, ElementUpdate, InternDump, Key, ServerCommand};
use crate::error::{ProtocolError, Result};
use crate::opcode::{UpdateMode, ANCHOR_END, BLOCK_REF_FLAG, REMOVE_END, WINDOW_ID_LEN};
use crate::template::encode_template;

pub(crate) fn put_str16(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
        max: u16::MAX as usize,
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_key(buf: &mut BytesMut, field: &'static str, key: &Key) -> Result<()> {
    match key {
        Key::Code(INLINE_KEY) => Err(ProtocolError::ReservedId {
            field,
            value: INLINE_KEY,
        }),
        Key::Code(code) => {
            buf.put_u16(*code);
            Ok(())
        }
        Key::Inline(name) => {
            buf.put_u16(INLINE_KEY);
            put_str16(buf, field, name)
        }
    }
}

fn put_json<T: serde::Serialize>(buf: &mut BytesMut, field: &'static str, value: &T) -> Result<()> {
    let json =
        serde_json::to_string(value).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
    put_str16(buf, field, &json)
}

/// Split text into ATTACH_ANCHOR items, cutting at char boundaries
pub(crate) fn split_text(text: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut rest = text;
    while rest.len() > MAX_TEXT_ITEM {
        let mut cut = MAX_TEXT_ITEM;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        items.push(head);
        rest = tail;
    }
    items.push(rest);
    items
}

fn put_dump(buf: &mut BytesMut, names: &[String]) -> Result<()> {
    let count = u16::try_from(names.len()).map_err(|_| ProtocolError::FieldTooLong {
        field: "interning table",
        len: names.len(),
        max: u16::MAX as usize,
    })?;
    buf.put_u16(count);
    for name in names {
        put_str16(buf, "interned name", name)?;
    }
    Ok(())
}

fn put_tables(buf: &mut BytesMut, tables: &InternDump) -> Result<()> {
    put_dump(buf, &tables.tags)?;
    put_dump(buf, &tables.attributes)?;
    put_dump(buf, &tables.styles)?;
    put_dump(buf, &tables.events)
}

fn put_update(buf: &mut BytesMut, update: &ElementUpdate) -> Result<()> {
    match update {
        ElementUpdate::Style { key, value } => {
            buf.put_u8(UpdateMode::Style as u8);
            put_key(buf, "style key", key)?;
            put_str16(buf, "style value", value)
        }
        ElementUpdate::SetAttribute { key, value } => {
            buf.put_u8(UpdateMode::SetAttribute as u8);
            put_key(buf, "attribute key", key)?;
            put_str16(buf, "attribute value", value)
        }
        ElementUpdate::RemoveAttribute { key } => {
            buf.put_u8(UpdateMode::RemoveAttribute as u8);
            put_key(buf, "attribute key", key)
        }
        ElementUpdate::ToggleClass { name, on } => {
            buf.put_u8(UpdateMode::ToggleClass as u8);
            put_str16(buf, "class name", name)?;
            buf.put_u8(u8::from(*on));
            Ok(())
        }
        ElementUpdate::Checked(checked) => {
            buf.put_u8(UpdateMode::Checked as u8);
            buf.put_u8(u8::from(*checked));
            Ok(())
        }
    }
}

fn put_command(buf: &mut BytesMut, command: &ServerCommand) -> Result<()> {
    buf.put_u8(command.opcode() as u8);
    match command {
        ServerCommand::Ping => {}
        ServerCommand::InstallTemplate { id, template } => {
            let mut body = BytesMut::new();
            encode_template(&mut body, template)?;
            let len = u16::try_from(body.len()).map_err(|_| ProtocolError::FieldTooLong {
                field: "template buffer",
                len: body.len(),
                max: u16::MAX as usize,
            })?;
            buf.put_u16(*id);
            buf.put_u16(len);
            buf.put_slice(&body);
        }
        ServerCommand::InitWindow { window_id, tables } => {
            if window_id.len() != WINDOW_ID_LEN {
                return Err(ProtocolError::InvalidWindowId(window_id.len()));
            }
            buf.put_slice(window_id.as_bytes());
            put_tables(buf, tables)?;
        }
        ServerCommand::AttachAnchor {
            block,
            anchor,
            content,
        } => {
            buf.put_u16(*block);
            buf.put_u8(*anchor);
            for item in content {
                match item {
                    Content::Block(id) => {
                        if *id > MAX_BLOCK_ID {
                            return Err(ProtocolError::ReservedId {
                                field: "anchor block ref",
                                value: *id,
                            });
                        }
                        buf.put_u16(BLOCK_REF_FLAG | *id);
                    }
                    Content::Text(text) => {
                        for part in split_text(text) {
                            // split_text bounds every part to 15 bits
                            buf.put_u16(part.len() as u16);
                            buf.put_slice(part.as_bytes());
                        }
                    }
                }
            }
            buf.put_u16(ANCHOR_END);
        }
        ServerCommand::ClientDataSet { cookie, expiration } => {
            put_str16(buf, "cookie", cookie)?;
            buf.put_u32(*expiration);
        }
        ServerCommand::AttachEvent {
            block,
            target,
            event,
            handler,
        } => {
            buf.put_u16(*block);
            buf.put_u8(*target);
            buf.put_u8(*event);
            buf.put_u16(*handler);
        }
        ServerCommand::Nav { path } => put_str16(buf, "path", path)?,
        ServerCommand::ElementUpdate {
            block,
            target,
            update,
        } => {
            buf.put_u16(*block);
            buf.put_u8(*target);
            put_update(buf, update)?;
        }
        ServerCommand::InitBlock { block, template } => {
            buf.put_u16(*block);
            buf.put_u16(*template);
        }
        ServerCommand::RemoveBlocks { blocks } => {
            for id in blocks {
                if *id == REMOVE_END {
                    return Err(ProtocolError::ReservedId {
                        field: "removed block",
                        value: *id,
                    });
                }
                buf.put_u16(*id);
            }
            buf.put_u16(REMOVE_END);
        }
        ServerCommand::InstallClientFunction { id, function } => {
            buf.put_u16(*id);
            put_json(buf, "client function", function)?;
        }
        ServerCommand::RunClientFunction { id, args } => {
            buf.put_u16(*id);
            put_json(buf, "client function args", args)?;
        }
    }
    Ok(())
}

/// Append one command to `buf`
pub fn encode_command(buf: &mut BytesMut, command: &ServerCommand) -> Result<()> {
    let start = buf.len();
    let result = put_command(buf, command);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

/// Encode a transport frame holding `commands` in order
pub fn encode_frame(commands: &[ServerCommand]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for command in commands {
        put_command(&mut buf, command)?;
    }
    Ok(buf.freeze())
}

/// Encode a client-to-server message
pub fn encode_client_message(message: &ClientMessage) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u8(message.opcode() as u8);
    match message {
        ClientMessage::Pong { read_offset } => buf.put_u64(*read_offset),
        ClientMessage::Event { handler, data } => {
            buf.put_u16(*handler);
            put_str16(&mut buf, "event data", data)?;
        }
        ClientMessage::BackNav { path } => put_str16(&mut buf, "path", path)?,
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tendril_core::{BlockDefinition, TemplateNode};

    use crate::command::TemplateBuffer;

    #[test]
    fn test_attach_anchor_layout() {
        let command = ServerCommand::AttachAnchor {
            block: 3,
            anchor: 1,
            content: vec![Content::from("hi"), Content::Block(0x7FFE), Content::from("")],
        };
        let bytes = encode_frame(&[command]).unwrap();
        assert_eq!(
            &bytes[..],
            &[3, 0, 3, 1, 0, 2, b'h', b'i', 0xFF, 0xFE, 0, 0, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_block_ref_cannot_collide_with_terminator() {
        let command = ServerCommand::AttachAnchor {
            block: 0,
            anchor: 0,
            content: vec![Content::Block(0x7FFF)],
        };
        let mut buf = BytesMut::from(&b"keep"[..]);
        assert!(matches!(
            encode_command(&mut buf, &command),
            Err(ProtocolError::ReservedId { value: 0x7FFF, .. })
        ));
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_long_text_split_on_char_boundary() {
        let text = "é".repeat(MAX_TEXT_ITEM);
        let parts = split_text(&text);
        assert!(parts.iter().all(|part| part.len() <= MAX_TEXT_ITEM));
        assert_eq!(parts.concat(), text);
        assert_eq!(parts[0].len(), MAX_TEXT_ITEM - 1);
    }

    #[test]
    fn test_remove_blocks_rejects_terminator() {
        let command = ServerCommand::RemoveBlocks { blocks: vec![4, 0] };
        assert!(encode_frame(&[command]).is_err());

        let command = ServerCommand::RemoveBlocks {
            blocks: vec![4, 0xFFFF],
        };
        assert_eq!(
            &encode_frame(&[command]).unwrap()[..],
            &[9, 0, 4, 0xFF, 0xFF, 0, 0]
        );
    }

    #[test]
    fn test_element_update_inline_key() {
        let command = ServerCommand::ElementUpdate {
            block: 1,
            target: 255,
            update: ElementUpdate::Style {
                key: Key::Inline("gap".into()),
                value: String::new(),
            },
        };
        assert_eq!(
            &encode_frame(&[command]).unwrap()[..],
            &[7, 0, 1, 255, 0, 0xFF, 0xFF, 0, 3, b'g', b'a', b'p', 0, 0]
        );
    }

    #[test]
    fn test_window_id_length_checked() {
        let command = ServerCommand::InitWindow {
            window_id: "short".into(),
            tables: InternDump::default(),
        };
        assert_eq!(
            encode_frame(&[command]),
            Err(ProtocolError::InvalidWindowId(5))
        );
    }

    #[test]
    fn test_install_template_is_length_prefixed() {
        let definition =
            BlockDefinition::new(2, TemplateNode::element("b").child(TemplateNode::anchor()))
                .unwrap();
        let template = TemplateBuffer::from_definition(&definition, |_| Key::Code(4));
        let bytes = encode_frame(&[ServerCommand::InstallTemplate { id: 2, template }]).unwrap();

        let body_len = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        assert_eq!(bytes.len(), 5 + body_len);
        assert_eq!(&bytes[..3], &[1, 0, 2]);
    }

    #[test]
    fn test_client_message_layout() {
        let pong = encode_client_message(&ClientMessage::Pong { read_offset: 258 }).unwrap();
        assert_eq!(&pong[..], &[0, 0, 0, 0, 0, 0, 0, 1, 2]);

        let event = encode_client_message(&ClientMessage::Event {
            handler: 7,
            data: "x".into(),
        })
        .unwrap();
        assert_eq!(&event[..], &[1, 0, 7, 0, 1, b'x']);
    }
}
