use bytes::Buf;

use crate::clock::RefClocks;
use crate::event::Event;
use crate::frame::FrameDecompressor;
use crate::Result;

/// An event together with the thread context it arrived under.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub thread: u32,
    pub event: Event,
}

/// Receiving half of a connection: decompresses frames and rebuilds
/// absolute timestamps.
#[derive(Default)]
pub struct StreamDecoder {
    clocks: RefClocks,
    decompressor: FrameDecompressor,
    thread: u32,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.clocks.reset();
        self.decompressor.reset();
        self.thread = 0;
    }

    pub fn decode_frame(&mut self, body: &[u8]) -> Result<Vec<DecodedEvent>> {
        let plain = self.decompressor.decompress(body)?;
        self.decode_plain(&plain)
    }

    /// Decodes records from already decompressed bytes. Frames never split a
    /// record, so `plain` must hold whole records.
    pub fn decode_plain(&mut self, mut plain: &[u8]) -> Result<Vec<DecodedEvent>> {
        let mut events = Vec::new();
        while plain.has_remaining() {
            let event = Event::decode(&mut self.clocks, &mut plain)?;
            if let Event::ThreadContext(ctx) = &event {
                self.thread = ctx.thread;
            }
            events.push(DecodedEvent {
                thread: self.thread,
                event,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ThreadContext, ZoneBegin, ZoneEnd};
    use crate::frame::{read_frame, FrameCompressor};
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    fn test_decoder_tracks_thread_and_absolute_time() {
        let mut clocks = RefClocks::new();
        let mut plain = BytesMut::new();
        for event in [
            Event::ThreadContext(ThreadContext { thread: 11 }),
            Event::ZoneBegin(ZoneBegin { time: 500, srcloc: 1 }),
            Event::ZoneEnd(ZoneEnd { time: 520 }),
        ] {
            event.encode(&mut clocks, &mut plain).unwrap();
        }
        let mut compressor = FrameCompressor::new();
        let mut wire = BytesMut::new();
        compressor.compress(&plain, &mut wire);

        let mut reader = &wire[..];
        let body = read_frame(&mut reader).unwrap().unwrap();
        let mut decoder = StreamDecoder::new();
        let events = decoder.decode_frame(&body).unwrap();

        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.thread == 11));
        assert_eq!(events[1].event, Event::ZoneBegin(ZoneBegin { time: 500, srcloc: 1 }));
        assert_eq!(events[2].event, Event::ZoneEnd(ZoneEnd { time: 520 }));
    }
}
