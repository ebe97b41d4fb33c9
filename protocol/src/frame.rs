//! Streaming frame compression.
//!
//! Each frame on the wire is `[u32 len][len bytes]`, where the bytes are an
//! LZ4 block (with its plain size prepended) compressed against a rolling
//! dictionary made of the most recent plain bytes of the same connection.
//! Both ends reset the dictionary when a connection starts.

use bytes::{BufMut, BytesMut};
use std::io::{self, Read};

use crate::{ProtocolError, Result};

/// Upper bound on plain bytes per frame.
pub const TARGET_FRAME_SIZE: usize = 256 * 1024;
pub const DICTIONARY_SIZE: usize = 64 * 1024;
/// Largest compressed block accepted from the wire.
pub const MAX_COMPRESSED_SIZE: usize = TARGET_FRAME_SIZE + TARGET_FRAME_SIZE / 255 + 64;

#[derive(Default)]
struct Dictionary {
    bytes: Vec<u8>,
}

impl Dictionary {
    fn push(&mut self, plain: &[u8]) {
        if plain.len() >= DICTIONARY_SIZE {
            self.bytes.clear();
            self.bytes
                .extend_from_slice(&plain[plain.len() - DICTIONARY_SIZE..]);
            return;
        }
        let overflow = (self.bytes.len() + plain.len()).saturating_sub(DICTIONARY_SIZE);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend_from_slice(plain);
    }
}

#[derive(Default)]
pub struct FrameCompressor {
    dict: Dictionary,
}

impl FrameCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.dict.bytes.clear();
    }

    /// Compresses `plain` and appends the length-prefixed frame to `out`.
    pub fn compress(&mut self, plain: &[u8], out: &mut BytesMut) {
        debug_assert!(plain.len() <= TARGET_FRAME_SIZE);
        let block = lz4_flex::block::compress_prepend_size_with_dict(plain, &self.dict.bytes);
        out.reserve(4 + block.len());
        out.put_u32_le(block.len() as u32);
        out.put_slice(&block);
        self.dict.push(plain);
    }
}

#[derive(Default)]
pub struct FrameDecompressor {
    dict: Dictionary,
}

impl FrameDecompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.dict.bytes.clear();
    }

    /// Decompresses one frame body (without its u32 length prefix).
    pub fn decompress(&mut self, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4,
                available: block.len(),
            });
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&block[..4]);
        let plain_size = u32::from_le_bytes(size) as usize;
        if plain_size > TARGET_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(plain_size));
        }
        let plain = lz4_flex::block::decompress_size_prepended_with_dict(block, &self.dict.bytes)?;
        self.dict.push(&plain);
        Ok(plain)
    }
}

/// Reads one `[u32 len][bytes]` frame body. Returns `None` on a clean end of
/// stream at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_COMPRESSED_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
