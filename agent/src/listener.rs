use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use protocol::handshake::{DEFAULT_PORT, PORT_SEARCH_RANGE};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use tracing::debug;

use crate::config::Config;
use crate::{AgentError, Result};

const LISTENER_TOKEN: u64 = 0;

/// Listening socket with an epoll set to wait on it with a timeout.
pub(crate) struct Listener {
    socket: TcpListener,
    epoll: Epoll,
    port: u16,
}

fn bind_addresses(config: &Config) -> Vec<IpAddr> {
    if config.only_localhost {
        vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
    } else if config.only_ipv4 {
        vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
    } else {
        // Dual-stack first, plain IPv4 where IPv6 is unavailable.
        vec![
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ]
    }
}

fn candidate_ports(config: &Config) -> Vec<u16> {
    match config.port {
        Some(port) => vec![port],
        None => (DEFAULT_PORT..DEFAULT_PORT + PORT_SEARCH_RANGE).collect(),
    }
}

impl Listener {
    /// Binds the configured port, or the first free one of the default
    /// range.
    pub fn bind(config: &Config) -> Result<Self> {
        let ports = candidate_ports(config);
        let mut last_error = None;
        for port in &ports {
            for ip in bind_addresses(config) {
                match TcpListener::bind(SocketAddr::new(ip, *port)) {
                    Ok(socket) => return Self::from_socket(socket),
                    Err(e) => {
                        debug!(%ip, port, error = ?e, "bind failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        match (config.port, last_error) {
            (Some(_), Some(e)) => Err(e.into()),
            _ => Err(AgentError::NoFreePort {
                first: ports.first().copied().unwrap_or(DEFAULT_PORT),
                last: ports.last().copied().unwrap_or(DEFAULT_PORT),
            }),
        }
    }

    fn from_socket(socket: TcpListener) -> Result<Self> {
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(&socket, EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN))?;
        debug!(port, "listening for peers");
        Ok(Listener {
            socket,
            epoll,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits up to `timeout_ms` for a peer. The returned stream is blocking.
    pub fn accept(&self, timeout_ms: u16) -> Result<Option<(TcpStream, SocketAddr)>> {
        let mut events = [EpollEvent::empty(); 1];
        let ready = match self.epoll.wait(&mut events, EpollTimeout::from(timeout_ms)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        if ready == 0 {
            return Ok(None);
        }
        match self.socket.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Some((stream, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn local_config() -> Config {
        Config {
            port: Some(0),
            only_localhost: true,
            ..Default::default()
        }
    }

    #[rstest]
    fn test_ephemeral_port_is_reported(local_config: Config) {
        let listener = Listener::bind(&local_config).unwrap();
        assert_ne!(listener.port(), 0);
    }

    #[rstest]
    fn test_accept_times_out_without_peer(local_config: Config) {
        let listener = Listener::bind(&local_config).unwrap();
        assert!(listener.accept(5).unwrap().is_none());
    }

    #[rstest]
    fn test_accept_returns_blocking_stream(local_config: Config) {
        let listener = Listener::bind(&local_config).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", listener.port())).unwrap();
        let (stream, addr) = listener.accept(1000).unwrap().unwrap();
        assert!(addr.ip().is_loopback());
        assert!(stream.nodelay().unwrap());
    }

    #[rstest]
    fn test_fixed_port_in_use_is_an_error(local_config: Config) {
        let first = Listener::bind(&local_config).unwrap();
        let taken = Config {
            port: Some(first.port()),
            ..local_config
        };
        assert!(matches!(Listener::bind(&taken), Err(AgentError::Io(_))));
    }

    #[rstest]
    fn test_default_range() {
        let ports = candidate_ports(&Config::default());
        assert_eq!(ports.first(), Some(&DEFAULT_PORT));
        assert_eq!(ports.len(), PORT_SEARCH_RANGE as usize);
    }
}
