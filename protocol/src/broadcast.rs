use bytes::{Buf, BufMut};
use std::time::Duration;

use crate::handshake::{get_fixed_str, put_fixed_str, PROGRAM_NAME_SIZE};
use crate::{ProtocolError, Result};

pub const BROADCAST_VERSION: u16 = 1;
pub const DEFAULT_BROADCAST_PORT: u16 = 8086;
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);
/// `active_time` value announcing that the process stops advertising.
pub const ACTIVE_TIME_STOPPED: i32 = -1;

/// Discovery datagram sent while no peer is streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub broadcast_version: u16,
    pub listen_port: u16,
    pub protocol_version: u32,
    pub pid: u64,
    /// Seconds since the client started, or [`ACTIVE_TIME_STOPPED`].
    pub active_time: i32,
    pub program_name: String,
}

impl BroadcastMessage {
    pub const SIZE: usize = 2 + 2 + 4 + 8 + 4 + PROGRAM_NAME_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u16_le(self.broadcast_version);
        buf.put_u16_le(self.listen_port);
        buf.put_u32_le(self.protocol_version);
        buf.put_u64_le(self.pid);
        buf.put_i32_le(self.active_time);
        put_fixed_str(&mut buf, &self.program_name, PROGRAM_NAME_SIZE);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        let broadcast_version = bytes.get_u16_le();
        if broadcast_version != BROADCAST_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: BROADCAST_VERSION as u32,
                actual: broadcast_version as u32,
            });
        }
        Ok(BroadcastMessage {
            broadcast_version,
            listen_port: bytes.get_u16_le(),
            protocol_version: bytes.get_u32_le(),
            pid: bytes.get_u64_le(),
            active_time: bytes.get_i32_le(),
            program_name: get_fixed_str(&mut bytes, PROGRAM_NAME_SIZE),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.active_time < 0
    }
}
