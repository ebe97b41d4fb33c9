#![allow(dead_code)]

use agent::Config;
use protocol::handshake::{hello, HELLO_SIZE};
use protocol::{
    read_frame, DecodedEvent, Event, HandshakeStatus, ServerQuery, ServerQueryPacket,
    StreamDecoder, WelcomeMessage, PROTOCOL_VERSION,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .init();
    });
}

pub fn test_config() -> Config {
    Config {
        port: Some(0),
        broadcast: false,
        only_localhost: true,
        systrace: systrace::SamplerConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Minimal collector side of a connection.
pub struct Peer {
    pub stream: TcpStream,
    pub welcome: WelcomeMessage,
    decoder: StreamDecoder,
}

pub fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Sends the hello for `version` and returns the status byte.
pub fn greet(stream: &mut TcpStream, version: u32) -> HandshakeStatus {
    let greeting: [u8; HELLO_SIZE] = hello(version);
    stream.write_all(&greeting).unwrap();
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).unwrap();
    HandshakeStatus::from_u8(status[0]).unwrap()
}

impl Peer {
    pub fn connect(port: u16) -> Peer {
        let mut stream = connect(port);
        assert_eq!(greet(&mut stream, PROTOCOL_VERSION), HandshakeStatus::Welcome);
        let mut welcome = vec![0u8; WelcomeMessage::SIZE];
        stream.read_exact(&mut welcome).unwrap();
        Peer {
            stream,
            welcome: WelcomeMessage::decode(&welcome).unwrap(),
            decoder: StreamDecoder::new(),
        }
    }

    /// Next frame's records, `None` once the agent closed the stream.
    pub fn next_frame(&mut self) -> Option<Vec<DecodedEvent>> {
        let body = read_frame(&mut self.stream).unwrap()?;
        Some(self.decoder.decode_frame(&body).unwrap())
    }

    /// Collects records until `done` accepts one of them.
    pub fn recv_until(&mut self, mut done: impl FnMut(&Event) -> bool) -> Vec<DecodedEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            let Some(frame) = self.next_frame() else {
                break;
            };
            let finished = frame.iter().any(|e| done(&e.event));
            events.extend(frame);
            if finished {
                return events;
            }
        }
        panic!("expected record not received, got {events:?}");
    }

    /// Reads until the agent closes the connection.
    pub fn recv_to_end(&mut self) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        while let Some(frame) = self.next_frame() {
            events.extend(frame);
        }
        events
    }

    pub fn query(&mut self, query: ServerQuery, ptr: u64, extra: u32) {
        let packet = ServerQueryPacket::new(query, ptr, extra);
        self.stream.write_all(&packet.encode()).unwrap();
    }
}

/// Records other than keep-alives and thread markers.
pub fn payload_events(events: Vec<DecodedEvent>) -> Vec<DecodedEvent> {
    events
        .into_iter()
        .filter(|e| !matches!(e.event, Event::ThreadContext(_) | Event::KeepAlive))
        .collect()
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
