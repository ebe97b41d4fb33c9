//! Wire format shared by the streamtrace client and its collectors.

use thiserror::Error;

pub mod broadcast;
pub mod clock;
pub mod decode;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod payload;
pub mod query;

pub use broadcast::{BroadcastMessage, ACTIVE_TIME_STOPPED, BROADCAST_VERSION};
pub use clock::{RefClocks, TimeCategory};
pub use decode::{DecodedEvent, StreamDecoder};
pub use event::{Event, EventKind, HwCounter, TrailerKind};
pub use frame::{read_frame, FrameCompressor, FrameDecompressor, TARGET_FRAME_SIZE};
pub use handshake::{
    CpuArch, HandshakeStatus, WelcomeFlags, WelcomeMessage, PROTOCOL_VERSION, SHIBBOLETH,
};
pub use payload::Payload;
pub use query::{ServerQuery, ServerQueryPacket};

pub const VERSION: u32 = PROTOCOL_VERSION;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown event kind: {0}")]
    UnknownKind(u8),
    #[error("invalid value {value} in {kind:?} record")]
    InvalidField { kind: EventKind, value: u64 },
    #[error("truncated record: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("{kind:?} trailer too long: {len} bytes")]
    TrailerTooLong { kind: EventKind, len: usize },
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("handshake magic mismatch")]
    BadShibboleth,
    #[error("invalid handshake status: {0}")]
    InvalidStatus(u8),
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
