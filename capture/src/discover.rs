use eyre::{Context, Result};
use protocol::{BroadcastMessage, BROADCAST_VERSION, PROTOCOL_VERSION};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A client advertising itself on the broadcast port.
#[derive(Debug, Clone)]
pub struct Announcement {
    /// Data connection address: the sender's IP with the advertised port.
    pub addr: SocketAddr,
    pub message: BroadcastMessage,
}

impl Announcement {
    fn from_datagram(bytes: &[u8], from: SocketAddr) -> Option<Announcement> {
        let message = match BroadcastMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, error = %e, "ignoring malformed announcement");
                return None;
            }
        };
        if message.broadcast_version != BROADCAST_VERSION
            || message.protocol_version != PROTOCOL_VERSION
        {
            debug!(
                %from,
                broadcast_version = message.broadcast_version,
                protocol_version = message.protocol_version,
                "ignoring incompatible client"
            );
            return None;
        }
        if message.is_stopped() {
            debug!(%from, pid = message.pid, "client stopped advertising");
            return None;
        }
        Some(Announcement {
            addr: SocketAddr::new(from.ip(), message.listen_port),
            message,
        })
    }
}

/// Waits up to `timeout` for a compatible client to announce itself on
/// `port`. When `program` is given only clients with that name are taken.
pub fn discover(
    port: u16,
    program: Option<&str>,
    timeout: Duration,
) -> Result<Option<Announcement>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .with_context(|| format!("failed to bind discovery port={port}"))?;
    listen(&socket, program, timeout)
}

fn listen(
    socket: &UdpSocket,
    program: Option<&str>,
    timeout: Duration,
) -> Result<Option<Announcement>> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; BroadcastMessage::SIZE * 2];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        socket.set_read_timeout(Some(remaining))?;
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("discovery receive failed"),
        };
        let Some(announcement) = Announcement::from_datagram(&buf[..n], from) else {
            continue;
        };
        if program.is_some_and(|name| name != announcement.message.program_name) {
            continue;
        }
        info!(
            addr = %announcement.addr,
            pid = announcement.message.pid,
            program = %announcement.message.program_name,
            "found client"
        );
        return Ok(Some(announcement));
    }
}
