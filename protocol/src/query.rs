use crate::{ProtocolError, Result};

/// Requests a peer sends back over the data connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerQuery {
    Terminate = 0,
    String,
    ThreadString,
    SourceLocation,
    PlotName,
    FrameName,
    Parameter,
    CallstackFrame,
    ExternalName,
    Symbol,
    SymbolCode,
    SourceCode,
    DataTransfer,
    DataTransferPart,
    Disconnect,
}

impl ServerQuery {
    pub fn from_u8(value: u8) -> Option<ServerQuery> {
        Some(match value {
            0 => ServerQuery::Terminate,
            1 => ServerQuery::String,
            2 => ServerQuery::ThreadString,
            3 => ServerQuery::SourceLocation,
            4 => ServerQuery::PlotName,
            5 => ServerQuery::FrameName,
            6 => ServerQuery::Parameter,
            7 => ServerQuery::CallstackFrame,
            8 => ServerQuery::ExternalName,
            9 => ServerQuery::Symbol,
            10 => ServerQuery::SymbolCode,
            11 => ServerQuery::SourceCode,
            12 => ServerQuery::DataTransfer,
            13 => ServerQuery::DataTransferPart,
            14 => ServerQuery::Disconnect,
            _ => return None,
        })
    }
}

/// `[u8 opcode][u64 ptr][u32 extra]`, little endian.
///
/// The opcode is kept raw so that unknown requests can still be
/// acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerQueryPacket {
    pub opcode: u8,
    pub ptr: u64,
    pub extra: u32,
}

impl ServerQueryPacket {
    pub const SIZE: usize = 1 + 8 + 4;

    pub fn new(query: ServerQuery, ptr: u64, extra: u32) -> Self {
        ServerQueryPacket {
            opcode: query as u8,
            ptr,
            extra,
        }
    }

    pub fn query(&self) -> Option<ServerQuery> {
        ServerQuery::from_u8(self.opcode)
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.opcode;
        out[1..9].copy_from_slice(&self.ptr.to_le_bytes());
        out[9..13].copy_from_slice(&self.extra.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&bytes[1..9]);
        let mut extra = [0u8; 4];
        extra.copy_from_slice(&bytes[9..13]);
        Ok(ServerQueryPacket {
            opcode: bytes[0],
            ptr: u64::from_le_bytes(ptr),
            extra: u32::from_le_bytes(extra),
        })
    }
}
