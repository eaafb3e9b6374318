use serde::{Deserialize, Serialize};
use std::fmt;

/// First byte of every instruction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Begin = 0x01,
    Context = 0x02,
    Launch = 0x03,
    StreamIn = 0x04,
    StreamOut = 0x05,
    StreamOutBlocking = 0x06,
    AddDep = 0x07,
    Barrier = 0x08,
    Marker = 0x09,
    End = 0x0a,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Begin => "BEGIN",
            Opcode::Context => "CONTEXT",
            Opcode::Launch => "LAUNCH",
            Opcode::StreamIn => "STREAM_IN",
            Opcode::StreamOut => "STREAM_OUT",
            Opcode::StreamOutBlocking => "STREAM_OUT_BLOCKING",
            Opcode::AddDep => "ADD_DEP",
            Opcode::Barrier => "BARRIER",
            Opcode::Marker => "MARKER",
            Opcode::End => "END",
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Opcode::Begin,
            0x02 => Opcode::Context,
            0x03 => Opcode::Launch,
            0x04 => Opcode::StreamIn,
            0x05 => Opcode::StreamOut,
            0x06 => Opcode::StreamOutBlocking,
            0x07 => Opcode::AddDep,
            0x08 => Opcode::Barrier,
            0x09 => Opcode::Marker,
            0x0a => Opcode::End,
            _ => return None,
        })
    }

    /// Launches and transfers, i.e. one instruction per graph node.
    pub fn is_node_instruction(&self) -> bool {
        matches!(
            self,
            Opcode::Launch | Opcode::StreamIn | Opcode::StreamOut | Opcode::StreamOutBlocking
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_mapping() {
        for byte in 0x01..=0x0a {
            let op = Opcode::from_byte(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(0xff), None);
        assert_eq!(Opcode::StreamOutBlocking.to_string(), "STREAM_OUT_BLOCKING");
    }
}
