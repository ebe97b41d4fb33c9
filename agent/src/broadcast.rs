use protocol::broadcast::BROADCAST_INTERVAL;
use protocol::{BroadcastMessage, ACTIVE_TIME_STOPPED, BROADCAST_VERSION, PROTOCOL_VERSION};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::Result;

/// Advertises the listening port over UDP while no peer is connected.
pub(crate) struct Broadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    message: BroadcastMessage,
    started: Instant,
    last_sent: Option<Instant>,
    warned: bool,
}

impl Broadcaster {
    pub fn new(config: &Config, listen_port: u16, pid: u64, program_name: &str) -> Result<Self> {
        let ip = if config.only_localhost {
            Ipv4Addr::new(127, 255, 255, 255)
        } else {
            Ipv4Addr::BROADCAST
        };
        let target = SocketAddr::V4(SocketAddrV4::new(ip, config.broadcast_port));
        Self::with_target(target, listen_port, pid, program_name)
    }

    pub fn with_target(
        target: SocketAddr,
        listen_port: u16,
        pid: u64,
        program_name: &str,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        debug!(addr = %target, "broadcasting presence");
        Ok(Broadcaster {
            socket,
            target,
            message: BroadcastMessage {
                broadcast_version: BROADCAST_VERSION,
                listen_port,
                protocol_version: PROTOCOL_VERSION,
                pid,
                active_time: 0,
                program_name: program_name.to_owned(),
            },
            started: Instant::now(),
            last_sent: None,
            warned: false,
        })
    }

    /// Sends an announcement when the interval has elapsed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        if self
            .last_sent
            .is_some_and(|last| now.duration_since(last) < BROADCAST_INTERVAL)
        {
            return;
        }
        self.last_sent = Some(now);
        let active = now.duration_since(self.started).as_secs();
        self.message.active_time = active.min(i32::MAX as u64) as i32;
        self.send();
    }

    /// Tells listeners the process is no longer available; the next
    /// [`tick`](Self::tick) resumes announcing.
    pub fn stop(&mut self) {
        self.message.active_time = ACTIVE_TIME_STOPPED;
        self.send();
        self.last_sent = None;
    }

    fn send(&mut self) {
        if let Err(e) = self.socket.send_to(&self.message.encode(), self.target) {
            if !self.warned {
                self.warned = true;
                warn!(addr = %self.target, error = ?e, "broadcast failed");
            }
        }
    }
}
