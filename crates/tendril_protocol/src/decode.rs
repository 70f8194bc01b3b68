//! Binary decoder
//!
//! The stream has no resynchronization marker, so every error here is fatal
//! for the connection that produced the bytes.

use tendril_core::{Content, INLINE_KEY};

use crate::command::{
    ClientFunction, ClientMessage, ElementUpdate, InternDump, Key, ServerCommand,
};
use crate::error::{ProtocolError, Result};
use crate::opcode::{
    ClientOpcode, Opcode, UpdateMode, ANCHOR_END, BLOCK_REF_FLAG, REMOVE_END, WINDOW_ID_LEN,
};
use crate::template::decode_template;

/// Cursor over a big-endian byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_be_bytes)
    }

    /// A UTF-8 string of exactly `len` bytes
    pub fn string(&mut self, len: usize) -> Result<String> {
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// A `u16`-length-prefixed string
    pub fn str16(&mut self) -> Result<String> {
        let len = self.u16()?;
        self.string(usize::from(len))
    }

    /// An interned key or an inline string
    pub fn key(&mut self) -> Result<Key> {
        match self.u16()? {
            INLINE_KEY => self.str16().map(Key::Inline),
            code => Ok(Key::Code(code)),
        }
    }

    /// Fail if any bytes are left
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            left => Err(ProtocolError::TrailingBytes(left)),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(reader: &mut ByteReader<'_>) -> Result<T> {
    let json = reader.str16()?;
    serde_json::from_str(&json).map_err(|err| ProtocolError::InvalidJson(err.to_string()))
}

fn read_dump(reader: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let count = reader.u16()?;
    (0..count).map(|_| reader.str16()).collect()
}

fn read_update(reader: &mut ByteReader<'_>) -> Result<ElementUpdate> {
    let mode = reader.u8()?;
    let update = match UpdateMode::from_u8(mode).ok_or(ProtocolError::InvalidMode(mode))? {
        UpdateMode::Style => ElementUpdate::Style {
            key: reader.key()?,
            value: reader.str16()?,
        },
        UpdateMode::SetAttribute => ElementUpdate::SetAttribute {
            key: reader.key()?,
            value: reader.str16()?,
        },
        UpdateMode::RemoveAttribute => ElementUpdate::RemoveAttribute { key: reader.key()? },
        UpdateMode::ToggleClass => ElementUpdate::ToggleClass {
            name: reader.str16()?,
            on: reader.u8()? != 0,
        },
        UpdateMode::Checked => ElementUpdate::Checked(reader.u8()? != 0),
    };
    Ok(update)
}

/// Decode one command starting at the reader's position
pub fn decode_command(reader: &mut ByteReader<'_>) -> Result<ServerCommand> {
    let opcode = reader.u8()?;
    let command = match Opcode::from_u8(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))? {
        Opcode::Ping => ServerCommand::Ping,
        Opcode::InstallTemplate => {
            let id = reader.u16()?;
            let len = reader.u16()?;
            let mut body = ByteReader::new(reader.bytes(usize::from(len))?);
            let template = decode_template(&mut body)?;
            body.finish()?;
            ServerCommand::InstallTemplate { id, template }
        }
        Opcode::InitWindow => {
            let window_id = reader.string(WINDOW_ID_LEN)?;
            let tables = InternDump {
                tags: read_dump(reader)?,
                attributes: read_dump(reader)?,
                styles: read_dump(reader)?,
                events: read_dump(reader)?,
            };
            ServerCommand::InitWindow { window_id, tables }
        }
        Opcode::AttachAnchor => {
            let block = reader.u16()?;
            let anchor = reader.u8()?;
            let mut content = Vec::new();
            loop {
                let item = reader.u16()?;
                if item == ANCHOR_END {
                    break;
                }
                if item & BLOCK_REF_FLAG != 0 {
                    content.push(Content::Block(item & !BLOCK_REF_FLAG));
                } else {
                    content.push(Content::Text(reader.string(usize::from(item))?));
                }
            }
            ServerCommand::AttachAnchor {
                block,
                anchor,
                content,
            }
        }
        Opcode::ClientDataSet => ServerCommand::ClientDataSet {
            cookie: reader.str16()?,
            expiration: reader.u32()?,
        },
        Opcode::AttachEvent => ServerCommand::AttachEvent {
            block: reader.u16()?,
            target: reader.u8()?,
            event: reader.u8()?,
            handler: reader.u16()?,
        },
        Opcode::Nav => ServerCommand::Nav {
            path: reader.str16()?,
        },
        Opcode::ElementUpdate => ServerCommand::ElementUpdate {
            block: reader.u16()?,
            target: reader.u8()?,
            update: read_update(reader)?,
        },
        Opcode::InitBlock => ServerCommand::InitBlock {
            block: reader.u16()?,
            template: reader.u16()?,
        },
        Opcode::RemoveBlocks => {
            let mut blocks = Vec::new();
            loop {
                match reader.u16()? {
                    REMOVE_END => break,
                    id => blocks.push(id),
                }
            }
            ServerCommand::RemoveBlocks { blocks }
        }
        Opcode::InstallClientFunction => ServerCommand::InstallClientFunction {
            id: reader.u16()?,
            function: read_json::<ClientFunction>(reader)?,
        },
        Opcode::RunClientFunction => ServerCommand::RunClientFunction {
            id: reader.u16()?,
            args: read_json::<Vec<serde_json::Value>>(reader)?,
        },
    };
    Ok(command)
}

/// Decode every command of a transport frame
///
/// Either the whole frame decodes or nothing is returned.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<ServerCommand>> {
    let mut reader = ByteReader::new(frame);
    let mut commands = Vec::new();
    while !reader.is_empty() {
        commands.push(decode_command(&mut reader)?);
    }
    Ok(commands)
}

/// Decode a client-to-server message, which must fill `message` exactly
pub fn decode_client_message(message: &[u8]) -> Result<ClientMessage> {
    let mut reader = ByteReader::new(message);
    let tag = reader.u8()?;
    let decoded = match ClientOpcode::from_u8(tag).ok_or(ProtocolError::UnknownOpcode(tag))? {
        ClientOpcode::Pong => ClientMessage::Pong {
            read_offset: reader.u64()?,
        },
        ClientOpcode::Event => ClientMessage::Event {
            handler: reader.u16()?,
            data: reader.str16()?,
        },
        ClientOpcode::BackNav => ClientMessage::BackNav {
            path: reader.str16()?,
        },
    };
    reader.finish()?;
    Ok(decoded)
}
