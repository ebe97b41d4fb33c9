//! Sending half of one peer connection.

use bytes::BytesMut;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use protocol::event::ThreadContext;
use protocol::{Event, FrameCompressor, RefClocks, ServerQueryPacket, TARGET_FRAME_SIZE};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{AgentError, Result};

/// Owns the socket, delta clocks and compressor state of the current peer.
/// Everything here is reset by building a new connection.
pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    clocks: RefClocks,
    compressor: FrameCompressor,
    plain: BytesMut,
    wire: BytesMut,
    thread: Option<u32>,
    inbound: [u8; ServerQueryPacket::SIZE],
    inbound_len: usize,
    sent_bytes: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, write_timeout: Duration) -> Result<Self> {
        stream.set_write_timeout(Some(write_timeout))?;
        Ok(Connection {
            stream,
            peer,
            clocks: RefClocks::new(),
            compressor: FrameCompressor::new(),
            plain: BytesMut::with_capacity(TARGET_FRAME_SIZE),
            wire: BytesMut::new(),
            thread: None,
            inbound: [0; ServerQueryPacket::SIZE],
            inbound_len: 0,
            sent_bytes: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Appends a record produced by `thread`, announcing the thread first
    /// when it differs from the previous record's.
    pub fn append(&mut self, thread: u32, event: &Event) -> Result<()> {
        if self.thread != Some(thread) {
            self.thread = Some(thread);
            self.clocks.reset_thread();
            self.append_record(&Event::ThreadContext(ThreadContext { thread }))?;
        }
        self.append_record(event)
    }

    /// Appends a record that belongs to no thread: control records and
    /// query answers.
    pub fn append_record(&mut self, event: &Event) -> Result<()> {
        let len = event.encoded_len();
        if len > TARGET_FRAME_SIZE {
            warn!(kind = ?event.kind(), len, "record larger than a frame, dropped");
            return Ok(());
        }
        if self.plain.len() + len > TARGET_FRAME_SIZE {
            self.flush()?;
        }
        event.encode(&mut self.clocks, &mut self.plain)?;
        Ok(())
    }

    /// Compresses and sends everything appended so far as one frame.
    pub fn flush(&mut self) -> Result<()> {
        if self.plain.is_empty() {
            return Ok(());
        }
        self.wire.clear();
        self.compressor.compress(&self.plain, &mut self.wire);
        self.plain.clear();
        self.stream.write_all(&self.wire)?;
        self.sent_bytes += self.wire.len() as u64;
        Ok(())
    }

    /// Raw bytes outside the framed stream (handshake replies).
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Whether the peer has sent anything not read yet.
    pub fn has_data(&self, timeout_ms: u16) -> Result<bool> {
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0].revents().is_some_and(|r| !r.is_empty())),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the next complete query if one is available without blocking.
    /// A closed socket is reported as [`AgentError::Disconnected`].
    pub fn poll_query(&mut self) -> Result<Option<ServerQueryPacket>> {
        if !self.has_data(0)? {
            return Ok(None);
        }
        let n = match self.stream.read(&mut self.inbound[self.inbound_len..]) {
            Ok(0) => return Err(AgentError::Disconnected),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.inbound_len += n;
        if self.inbound_len < ServerQueryPacket::SIZE {
            return Ok(None);
        }
        self.inbound_len = 0;
        Ok(Some(ServerQueryPacket::decode(&self.inbound)?))
    }

    pub fn close(self) {
        debug!(peer = %self.peer, sent = self.sent_bytes, "connection closed");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::event::{ZoneBegin, ZoneEnd};
    use protocol::{read_frame, ServerQuery, StreamDecoder};
    use rstest::*;
    use std::net::TcpListener;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, addr) = listener.accept().unwrap();
        let conn = Connection::new(stream, addr, Duration::from_secs(1)).unwrap();
        (conn, peer)
    }

    fn read_events(peer: &mut TcpStream, decoder: &mut StreamDecoder) -> Vec<(u32, Event)> {
        let body = read_frame(peer).unwrap().unwrap();
        decoder
            .decode_frame(&body)
            .unwrap()
            .into_iter()
            .map(|d| (d.thread, d.event))
            .collect()
    }

    #[rstest]
    fn test_thread_switch_inserts_context() {
        let (mut conn, mut peer) = pair();
        conn.append(7, &Event::ZoneBegin(ZoneBegin { time: 500, srcloc: 1 }))
            .unwrap();
        conn.append(8, &Event::ZoneBegin(ZoneBegin { time: 300, srcloc: 2 }))
            .unwrap();
        conn.append(7, &Event::ZoneEnd(ZoneEnd { time: 520 }))
            .unwrap();
        conn.flush().unwrap();

        let mut decoder = StreamDecoder::new();
        let events = read_events(&mut peer, &mut decoder);
        let zones: Vec<(u32, Event)> = events
            .into_iter()
            .filter(|(_, e)| !matches!(e, Event::ThreadContext(_)))
            .collect();
        assert_eq!(
            zones,
            vec![
                (7, Event::ZoneBegin(ZoneBegin { time: 500, srcloc: 1 })),
                (8, Event::ZoneBegin(ZoneBegin { time: 300, srcloc: 2 })),
                (7, Event::ZoneEnd(ZoneEnd { time: 520 })),
            ]
        );
    }

    #[rstest]
    fn test_large_batches_split_into_frames() {
        let (mut conn, mut peer) = pair();
        let count = TARGET_FRAME_SIZE / 8;
        for i in 0..count {
            conn.append(1, &Event::ZoneEnd(ZoneEnd { time: i as i64 }))
                .unwrap();
        }
        conn.flush().unwrap();
        drop(conn);

        let mut decoder = StreamDecoder::new();
        let mut frames = 0;
        let mut seen = 0;
        while let Some(body) = read_frame(&mut peer).unwrap() {
            frames += 1;
            seen += decoder
                .decode_frame(&body)
                .unwrap()
                .iter()
                .filter(|d| matches!(d.event, Event::ZoneEnd(_)))
                .count();
        }
        assert!(frames > 1);
        assert_eq!(seen, count);
    }

    #[rstest]
    fn test_partial_query_is_buffered() {
        let (mut conn, mut peer) = pair();
        let packet = ServerQueryPacket::new(ServerQuery::String, 0xabcd, 0).encode();

        peer.write_all(&packet[..5]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(conn.poll_query().unwrap(), None);

        peer.write_all(&packet[5..]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let query = conn.poll_query().unwrap().unwrap();
        assert_eq!(query.query(), Some(ServerQuery::String));
        assert_eq!(query.ptr, 0xabcd);
    }

    #[rstest]
    fn test_peer_close_is_reported() {
        let (mut conn, peer) = pair();
        drop(peer);
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(conn.poll_query(), Err(AgentError::Disconnected)));
    }
}
