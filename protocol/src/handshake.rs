//! Connection handshake and the welcome record sent on acceptance.
//!
//! The peer opens with [`SHIBBOLETH`] followed by its protocol version as a
//! little-endian u32. The client answers with one [`HandshakeStatus`] byte and,
//! on [`HandshakeStatus::Welcome`], a fixed-size [`WelcomeMessage`].

use bytes::{Buf, BufMut};
use std::time::Duration;

use crate::{ProtocolError, Result};

pub const SHIBBOLETH: [u8; 8] = *b"StrmTrce";
pub const PROTOCOL_VERSION: u32 = 1;
pub const HELLO_SIZE: usize = SHIBBOLETH.len() + 4;

pub const DEFAULT_PORT: u16 = 8086;
/// Ports tried after the default one when no port is configured.
pub const PORT_SEARCH_RANGE: u16 = 20;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2000);

pub const PROGRAM_NAME_SIZE: usize = 64;
pub const HOST_INFO_SIZE: usize = 1024;
pub const CPU_MANUFACTURER_SIZE: usize = 12;

pub fn hello(version: u32) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[..SHIBBOLETH.len()].copy_from_slice(&SHIBBOLETH);
    out[SHIBBOLETH.len()..].copy_from_slice(&version.to_le_bytes());
    out
}

/// Checks the magic token and returns the peer's protocol version.
pub fn parse_hello(bytes: &[u8; HELLO_SIZE]) -> Result<u32> {
    if bytes[..SHIBBOLETH.len()] != SHIBBOLETH {
        return Err(ProtocolError::BadShibboleth);
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[SHIBBOLETH.len()..]);
    Ok(u32::from_le_bytes(version))
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending = 0,
    Welcome = 1,
    ProtocolMismatch = 2,
    NotAvailable = 3,
    Dropped = 4,
}

impl HandshakeStatus {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(HandshakeStatus::Pending),
            1 => Ok(HandshakeStatus::Welcome),
            2 => Ok(HandshakeStatus::ProtocolMismatch),
            3 => Ok(HandshakeStatus::NotAvailable),
            4 => Ok(HandshakeStatus::Dropped),
            other => Err(ProtocolError::InvalidStatus(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WelcomeFlags(pub u8);

impl WelcomeFlags {
    pub const ON_DEMAND: u8 = 1 << 0;
    pub const CODE_TRANSFER: u8 = 1 << 1;
    pub const COMBINE_SAMPLES: u8 = 1 << 2;
    pub const IDENTIFY_SAMPLES: u8 = 1 << 3;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    Unknown = 0,
    X86,
    X64,
    Arm32,
    Arm64,
}

impl CpuArch {
    pub fn current() -> CpuArch {
        if cfg!(target_arch = "x86_64") {
            CpuArch::X64
        } else if cfg!(target_arch = "x86") {
            CpuArch::X86
        } else if cfg!(target_arch = "aarch64") {
            CpuArch::Arm64
        } else if cfg!(target_arch = "arm") {
            CpuArch::Arm32
        } else {
            CpuArch::Unknown
        }
    }

    pub fn from_u8(value: u8) -> CpuArch {
        match value {
            1 => CpuArch::X86,
            2 => CpuArch::X64,
            3 => CpuArch::Arm32,
            4 => CpuArch::Arm64,
            _ => CpuArch::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WelcomeMessage {
    /// Multiplier turning timer ticks into nanoseconds.
    pub timer_mul: f64,
    pub init_begin: i64,
    pub init_end: i64,
    /// Measured cost of one enqueue, in ns.
    pub delay: u64,
    /// Smallest observable clock step, in ns.
    pub resolution: u64,
    /// Process start, seconds since the unix epoch.
    pub epoch: u64,
    /// Executable modification time, seconds since the unix epoch.
    pub exec_time: u64,
    pub pid: u64,
    pub sampling_period: i64,
    pub flags: WelcomeFlags,
    pub cpu_arch: CpuArch,
    pub cpu_manufacturer: [u8; CPU_MANUFACTURER_SIZE],
    pub cpu_id: u32,
    pub program_name: String,
    pub host_info: String,
}

impl WelcomeMessage {
    pub const SIZE: usize =
        8 * 9 + 1 + 1 + CPU_MANUFACTURER_SIZE + 4 + PROGRAM_NAME_SIZE + HOST_INFO_SIZE;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f64_le(self.timer_mul);
        buf.put_i64_le(self.init_begin);
        buf.put_i64_le(self.init_end);
        buf.put_u64_le(self.delay);
        buf.put_u64_le(self.resolution);
        buf.put_u64_le(self.epoch);
        buf.put_u64_le(self.exec_time);
        buf.put_u64_le(self.pid);
        buf.put_i64_le(self.sampling_period);
        buf.put_u8(self.flags.0);
        buf.put_u8(self.cpu_arch as u8);
        buf.put_slice(&self.cpu_manufacturer);
        buf.put_u32_le(self.cpu_id);
        put_fixed_str(buf, &self.program_name, PROGRAM_NAME_SIZE);
        put_fixed_str(buf, &self.host_info, HOST_INFO_SIZE);
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }
        let timer_mul = bytes.get_f64_le();
        let init_begin = bytes.get_i64_le();
        let init_end = bytes.get_i64_le();
        let delay = bytes.get_u64_le();
        let resolution = bytes.get_u64_le();
        let epoch = bytes.get_u64_le();
        let exec_time = bytes.get_u64_le();
        let pid = bytes.get_u64_le();
        let sampling_period = bytes.get_i64_le();
        let flags = WelcomeFlags(bytes.get_u8());
        let cpu_arch = CpuArch::from_u8(bytes.get_u8());
        let mut cpu_manufacturer = [0u8; CPU_MANUFACTURER_SIZE];
        bytes.copy_to_slice(&mut cpu_manufacturer);
        let cpu_id = bytes.get_u32_le();
        let program_name = get_fixed_str(&mut bytes, PROGRAM_NAME_SIZE);
        let host_info = get_fixed_str(&mut bytes, HOST_INFO_SIZE);
        Ok(WelcomeMessage {
            timer_mul,
            init_begin,
            init_end,
            delay,
            resolution,
            epoch,
            exec_time,
            pid,
            sampling_period,
            flags,
            cpu_arch,
            cpu_manufacturer,
            cpu_id,
            program_name,
            host_info,
        })
    }
}

/// Writes `s` into a zero-padded field of `size` bytes, keeping at least one
/// terminating zero and never splitting a character.
pub(crate) fn put_fixed_str(buf: &mut impl BufMut, s: &str, size: usize) {
    let mut len = s.len().min(size - 1);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_slice(&s.as_bytes()[..len]);
    buf.put_bytes(0, size - len);
}

pub(crate) fn get_fixed_str(bytes: &mut &[u8], size: usize) -> String {
    let field = &bytes[..size];
    let end = field.iter().position(|&b| b == 0).unwrap_or(size);
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    bytes.advance(size);
    s
}
