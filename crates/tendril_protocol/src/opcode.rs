//! Opcode tables

/// Server-to-client command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0,
    InstallTemplate = 1,
    InitWindow = 2,
    AttachAnchor = 3,
    ClientDataSet = 4,
    AttachEvent = 5,
    Nav = 6,
    ElementUpdate = 7,
    InitBlock = 8,
    RemoveBlocks = 9,
    InstallClientFunction = 10,
    RunClientFunction = 11,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Opcode::Ping,
            1 => Opcode::InstallTemplate,
            2 => Opcode::InitWindow,
            3 => Opcode::AttachAnchor,
            4 => Opcode::ClientDataSet,
            5 => Opcode::AttachEvent,
            6 => Opcode::Nav,
            7 => Opcode::ElementUpdate,
            8 => Opcode::InitBlock,
            9 => Opcode::RemoveBlocks,
            10 => Opcode::InstallClientFunction,
            11 => Opcode::RunClientFunction,
            _ => return None,
        })
    }
}

/// Client-to-server message tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientOpcode {
    /// Heartbeat and PING reply carrying the client's read offset
    Pong = 0,
    Event = 1,
    BackNav = 3,
}

impl ClientOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ClientOpcode::Pong),
            1 => Some(ClientOpcode::Event),
            3 => Some(ClientOpcode::BackNav),
            _ => None,
        }
    }
}

/// ELEMENT_UPDATE mode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateMode {
    Style = 0,
    SetAttribute = 1,
    RemoveAttribute = 2,
    ToggleClass = 3,
    Checked = 4,
}

impl UpdateMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(UpdateMode::Style),
            1 => Some(UpdateMode::SetAttribute),
            2 => Some(UpdateMode::RemoveAttribute),
            3 => Some(UpdateMode::ToggleClass),
            4 => Some(UpdateMode::Checked),
            _ => None,
        }
    }
}

/// Terminates the item list of ATTACH_ANCHOR
pub const ANCHOR_END: u16 = 0xFFFF;

/// High bit of an ATTACH_ANCHOR item marks a block reference
pub const BLOCK_REF_FLAG: u16 = 0x8000;

/// Terminates the id list of REMOVE_BLOCKS
pub const REMOVE_END: u16 = 0;

/// Length of the window id in INIT_WINDOW
pub const WINDOW_ID_LEN: usize = 21;

/// Template node tags inside an INSTALL_TEMPLATE buffer
pub(crate) const NODE_ELEMENT: u8 = 0x01;
pub(crate) const NODE_TEXT: u8 = 0x02;
pub(crate) const NODE_ANCHOR: u8 = 0x03;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_is_dense() {
        for value in 0..=11u8 {
            let opcode = Opcode::from_u8(value).unwrap();
            assert_eq!(opcode as u8, value);
        }
        assert_eq!(Opcode::from_u8(12), None);
        assert_eq!(Opcode::from_u8(255), None);
    }

    #[test]
    fn test_client_opcodes() {
        assert_eq!(ClientOpcode::from_u8(1), Some(ClientOpcode::Event));
        assert_eq!(ClientOpcode::from_u8(2), None);
        assert_eq!(ClientOpcode::BackNav as u8, 3);
    }
}
