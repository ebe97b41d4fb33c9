use eyre::{bail, Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use protocol::handshake::{hello, HANDSHAKE_TIMEOUT};
use protocol::{
    read_frame, DecodedEvent, Event, HandshakeStatus, ProtocolError, ServerQuery,
    ServerQueryPacket, StreamDecoder, WelcomeMessage, PROTOCOL_VERSION,
};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Frames arrive whole once the first byte is readable; this only bounds a
/// stalled client.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one [`Session::poll`].
#[derive(Debug)]
pub enum Poll {
    Events(Vec<DecodedEvent>),
    Idle,
    /// The client closed the connection.
    Closed,
}

/// One data connection to a client.
///
/// Decodes incoming frames and asks the client for every name, thread and
/// source location the stream refers to, once each.
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    welcome: WelcomeMessage,
    decoder: StreamDecoder,
    requested: HashSet<(ServerQuery, u64)>,
    terminated: bool,
    disconnecting: bool,
}

impl Session {
    pub fn connect(peer: SocketAddr, timeout: Duration) -> Result<Session> {
        let mut stream = TcpStream::connect_timeout(&peer, timeout)
            .with_context(|| format!("failed to connect addr={peer}"))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        stream.write_all(&hello(PROTOCOL_VERSION))?;
        let mut status = [0u8; 1];
        stream
            .read_exact(&mut status)
            .context("client closed the connection during handshake")?;
        match HandshakeStatus::from_u8(status[0])? {
            HandshakeStatus::Welcome => {}
            HandshakeStatus::ProtocolMismatch => {
                bail!("client speaks a different protocol version than {PROTOCOL_VERSION}")
            }
            HandshakeStatus::NotAvailable => {
                bail!("client was already captured and is not in on-demand mode")
            }
            other => bail!("unexpected handshake status {other:?}"),
        }
        let mut welcome = vec![0u8; WelcomeMessage::SIZE];
        stream.read_exact(&mut welcome)?;
        let welcome = WelcomeMessage::decode(&welcome)?;
        stream.set_read_timeout(Some(FRAME_READ_TIMEOUT))?;

        info!(
            addr = %peer,
            pid = welcome.pid,
            program = %welcome.program_name,
            "connected"
        );
        Ok(Session {
            stream,
            peer,
            welcome,
            decoder: StreamDecoder::new(),
            requested: HashSet::new(),
            terminated: false,
            disconnecting: false,
        })
    }

    pub fn welcome(&self) -> &WelcomeMessage {
        &self.welcome
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the client announced the end of its stream.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Waits up to `timeout` for the next frame.
    pub fn poll(&mut self, timeout: Duration) -> Result<Poll> {
        if !self.readable(timeout)? {
            return Ok(Poll::Idle);
        }
        let body = match read_frame(&mut self.stream) {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(Poll::Closed),
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                return Ok(Poll::Closed)
            }
            Err(e) => return Err(e).context("failed to read frame"),
        };
        let events = self
            .decoder
            .decode_frame(&body)
            .context("failed to decode frame")?;
        trace!(records = events.len(), "frame");
        for event in &events {
            self.follow_up(event)?;
        }
        Ok(Poll::Events(events))
    }

    /// Asks the client to end the stream. It closes the connection once the
    /// request is read.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.disconnecting || self.terminated {
            return Ok(());
        }
        self.disconnecting = true;
        debug!("requesting disconnect");
        self.send(ServerQuery::Disconnect, 0)
    }

    fn readable(&self, timeout: Duration) -> Result<bool> {
        let timeout = PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16);
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0].revents().is_some_and(|r| !r.is_empty())),
            Err(e) => Err(e).context("poll failed"),
        }
    }

    fn follow_up(&mut self, decoded: &DecodedEvent) -> Result<()> {
        match &decoded.event {
            Event::ThreadContext(context) => {
                self.request(ServerQuery::ThreadString, context.thread as u64)?
            }
            Event::ZoneBegin(zone) | Event::ZoneBeginCallstack(zone) => {
                self.request(ServerQuery::SourceLocation, zone.srcloc)?
            }
            Event::SourceLocation(location) => {
                for id in [location.name, location.function, location.file] {
                    self.request(ServerQuery::String, id)?;
                }
            }
            Event::PlotData(plot) => self.request(ServerQuery::PlotName, plot.name)?,
            Event::FrameMark(mark) => self.request(ServerQuery::FrameName, mark.name)?,
            Event::ParameterSetup(parameter) => {
                self.request(ServerQuery::String, parameter.name)?
            }
            Event::Terminate => {
                self.terminated = true;
                debug!("client terminating");
                self.send(ServerQuery::Terminate, 0)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn request(&mut self, query: ServerQuery, ptr: u64) -> Result<()> {
        if ptr == 0 || self.disconnecting || self.terminated {
            return Ok(());
        }
        if !self.requested.insert((query, ptr)) {
            return Ok(());
        }
        self.send(query, ptr)
    }

    fn send(&mut self, query: ServerQuery, ptr: u64) -> Result<()> {
        let packet = ServerQueryPacket::new(query, ptr, 0);
        self.stream
            .write_all(&packet.encode())
            .with_context(|| format!("failed to send {query:?} query"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::event::{PlotData, SourceLocation, ThreadContext, ZoneBegin};
    use protocol::handshake::HELLO_SIZE;
    use protocol::{CpuArch, WelcomeFlags};
    use rstest::*;
    use std::net::TcpListener;
    use std::thread;

    fn welcome() -> WelcomeMessage {
        WelcomeMessage {
            timer_mul: 1.0,
            init_begin: 10,
            init_end: 20,
            delay: 0,
            resolution: 1,
            epoch: 0,
            exec_time: 0,
            pid: 4242,
            sampling_period: 0,
            flags: WelcomeFlags::default(),
            cpu_arch: CpuArch::current(),
            cpu_manufacturer: [0; 12],
            cpu_id: 0,
            program_name: "fake".to_string(),
            host_info: String::new(),
        }
    }

    /// Accepts one connection, answers the hello with `status` and hands the
    /// socket to `then`.
    fn fake_client(
        status: HandshakeStatus,
        then: impl FnOnce(TcpStream) + Send + 'static,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut greeting = [0u8; HELLO_SIZE];
            stream.read_exact(&mut greeting).unwrap();
            stream.write_all(&[status as u8]).unwrap();
            if status == HandshakeStatus::Welcome {
                let mut buf = Vec::new();
                welcome().encode(&mut buf);
                stream.write_all(&buf).unwrap();
            }
            then(stream);
        });
        addr
    }

    fn read_queries(stream: &mut TcpStream, count: usize) -> Vec<(ServerQuery, u64)> {
        (0..count)
            .map(|_| {
                let mut packet = [0u8; ServerQueryPacket::SIZE];
                stream.read_exact(&mut packet).unwrap();
                let packet = ServerQueryPacket::decode(&packet).unwrap();
                (packet.query().unwrap(), packet.ptr)
            })
            .collect()
    }

    fn decoded(event: Event) -> DecodedEvent {
        DecodedEvent { thread: 7, event }
    }

    #[rstest]
    fn test_welcome_is_read() {
        let addr = fake_client(HandshakeStatus::Welcome, |_| {});
        let session = Session::connect(addr, Duration::from_secs(1)).unwrap();
        assert_eq!(session.welcome().pid, 4242);
        assert_eq!(session.welcome().program_name, "fake");
    }

    #[rstest]
    #[case(HandshakeStatus::ProtocolMismatch, "protocol version")]
    #[case(HandshakeStatus::NotAvailable, "on-demand")]
    fn test_refusal_is_an_error(#[case] status: HandshakeStatus, #[case] reason: &str) {
        let addr = fake_client(status, |_| {});
        let err = Session::connect(addr, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains(reason), "{err}");
    }

    #[rstest]
    fn test_queries_are_sent_once_per_id() {
        let (tx, rx) = std::sync::mpsc::channel();
        let addr = fake_client(HandshakeStatus::Welcome, move |mut stream| {
            tx.send(read_queries(&mut stream, 6)).unwrap();
        });
        let mut session = Session::connect(addr, Duration::from_secs(1)).unwrap();

        let events = [
            Event::ThreadContext(ThreadContext { thread: 7 }),
            Event::ZoneBegin(ZoneBegin { time: 1, srcloc: 0x50 }),
            Event::ZoneBegin(ZoneBegin { time: 2, srcloc: 0x50 }),
            Event::SourceLocation(SourceLocation {
                ptr: 0x50,
                name: 0,
                function: 0x60,
                file: 0x70,
                line: 3,
                color: 0,
            }),
            Event::PlotData(PlotData {
                name: 0x80,
                time: 3,
                value: 1.0,
            }),
            Event::ThreadContext(ThreadContext { thread: 7 }),
            Event::Terminate,
        ];
        for event in events {
            session.follow_up(&decoded(event)).unwrap();
        }
        assert!(session.is_terminated());

        let queries = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            queries,
            vec![
                (ServerQuery::ThreadString, 7),
                (ServerQuery::SourceLocation, 0x50),
                (ServerQuery::String, 0x60),
                (ServerQuery::String, 0x70),
                (ServerQuery::PlotName, 0x80),
                (ServerQuery::Terminate, 0),
            ]
        );
    }

    #[rstest]
    fn test_idle_then_closed() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let addr = fake_client(HandshakeStatus::Welcome, move |stream| {
            let _ = rx.recv();
            drop(stream);
        });
        let mut session = Session::connect(addr, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            session.poll(Duration::from_millis(20)).unwrap(),
            Poll::Idle
        ));
        tx.send(()).unwrap();
        assert!(matches!(
            session.poll(Duration::from_secs(2)).unwrap(),
            Poll::Closed
        ));
    }
}
