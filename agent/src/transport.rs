//! The transport thread.
//!
//! One thread owns the queue consumer, the listening socket and at most one
//! peer connection. It cycles through
//! `Listening -> Handshaking -> Draining -> Streaming -> Disconnected` and
//! back, and leaves through `ShuttingDown` to `Finished` once a shutdown is
//! requested.

use bytes::{BufMut, BytesMut};
use mpscbuf::Consumer;
use protocol::event::OnDemandPayload;
use protocol::handshake::{parse_hello, HANDSHAKE_TIMEOUT, HELLO_SIZE};
use protocol::{Event, HandshakeStatus, WelcomeMessage, PROTOCOL_VERSION};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::broadcast::Broadcaster;
use crate::connection::Connection;
use crate::listener::Listener;
use crate::profiler::Shared;
use crate::query::{QueryAction, QueryResponder};
use crate::queue::SerialEntry;
use crate::{get_timestamp_ns, AgentError, Result};

const ACCEPT_TIMEOUT_MS: u16 = 10;
const IDLE_WAIT_MS: u16 = 10;
const KEEP_ALIVE_CYCLES: u32 = 500;
const SERIAL_LOCK_TIMEOUT: Duration = Duration::from_millis(10);
/// Records taken from the concurrent queue per cycle, so serial entries and
/// queries get a turn under sustained load.
const DRAIN_BUDGET: usize = 64 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Listening = 0,
    Handshaking,
    /// Replaying retained metadata to a new peer.
    Draining,
    Streaming,
    Disconnected,
    ShuttingDown,
    Finished,
}

impl TransportState {
    pub fn from_u8(value: u8) -> TransportState {
        match value {
            0 => TransportState::Listening,
            1 => TransportState::Handshaking,
            2 => TransportState::Draining,
            3 => TransportState::Streaming,
            4 => TransportState::Disconnected,
            5 => TransportState::ShuttingDown,
            _ => TransportState::Finished,
        }
    }
}

enum Step {
    Continue,
    Disconnect,
    Terminate,
}

enum Outcome {
    Disconnected,
    Finished,
}

pub(crate) struct Transport {
    shared: Arc<Shared>,
    consumer: Consumer<Event>,
    listener: Listener,
    broadcaster: Option<Broadcaster>,
    serial: Vec<SerialEntry>,
    served: bool,
}

impl Transport {
    pub fn new(shared: Arc<Shared>, consumer: Consumer<Event>, listener: Listener) -> Self {
        let broadcaster = if shared.config.broadcast {
            Broadcaster::new(
                &shared.config,
                shared.port,
                shared.welcome.pid,
                &shared.welcome.program_name,
            )
            .map_err(|e| warn!(error = ?e, "discovery broadcast unavailable"))
            .ok()
        } else {
            None
        };
        Transport {
            shared,
            consumer,
            listener,
            broadcaster,
            serial: Vec::new(),
            served: false,
        }
    }

    pub fn run(mut self) {
        self.shared
            .transport_tid
            .store(nix::unistd::gettid().as_raw(), Ordering::Release);

        while let Some((stream, peer)) = self.listen() {
            let conn = match self.handshake(stream, peer) {
                Ok(Some(conn)) => conn,
                Ok(None) => continue,
                Err(e) => {
                    debug!(%peer, error = ?e, "handshake failed");
                    continue;
                }
            };
            match self.serve(conn) {
                Outcome::Disconnected => continue,
                Outcome::Finished => break,
            }
        }

        if let Some(broadcaster) = &mut self.broadcaster {
            broadcaster.stop();
        }
        let discarded = self.clear();
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_state(TransportState::Finished);
        self.shared.transport_done.store(true, Ordering::Release);
        info!(discarded, "transport finished");
    }

    /// Drops everything queued without sending it. Returns the number of
    /// records discarded.
    fn clear(&mut self) -> usize {
        let mut discarded = self.consumer.clear();
        if self.shared.serial.swap(&mut self.serial, SERIAL_LOCK_TIMEOUT) {
            discarded += self.serial.len();
            self.serial.clear();
        }
        if discarded > 0 {
            trace!(discarded, "cleared queues");
        }
        discarded
    }

    /// Waits for a peer. Returns `None` once shutdown is requested, unless
    /// `no_exit` keeps the process waiting for someone to collect the data.
    fn listen(&mut self) -> Option<(TcpStream, SocketAddr)> {
        self.shared.set_state(TransportState::Listening);
        loop {
            let shutdown = self.shared.shutdown_requested();
            if shutdown && !self.shared.config.no_exit {
                return None;
            }
            if !shutdown {
                self.clear();
            }
            if self.available() {
                if let Some(broadcaster) = &mut self.broadcaster {
                    broadcaster.tick();
                }
            }
            match self.listener.accept(ACCEPT_TIMEOUT_MS) {
                Ok(Some(peer)) => return Some(peer),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = ?e, "accept failed");
                    thread::sleep(Duration::from_millis(ACCEPT_TIMEOUT_MS as u64));
                }
            }
        }
    }

    /// Whether a new peer would be welcomed. Outside on-demand mode the data
    /// belongs to the first peer.
    fn available(&self) -> bool {
        !self.served || self.shared.config.on_demand
    }

    fn handshake(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Option<Connection>> {
        self.shared.set_state(TransportState::Handshaking);
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let mut hello = [0u8; HELLO_SIZE];
        stream.read_exact(&mut hello)?;
        stream.set_read_timeout(None)?;

        let mut conn = Connection::new(stream, peer, self.shared.config.shutdown_timeout())?;
        let version = match parse_hello(&hello) {
            Ok(version) => version,
            Err(e) => {
                debug!(%peer, error = ?e, "not a streamtrace peer");
                conn.close();
                return Ok(None);
            }
        };
        if version != PROTOCOL_VERSION {
            warn!(%peer, version, expected = PROTOCOL_VERSION, "protocol mismatch");
            conn.send_raw(&[HandshakeStatus::ProtocolMismatch as u8])?;
            conn.close();
            return Ok(None);
        }
        if !self.available() {
            debug!(%peer, "data already collected by an earlier peer");
            conn.send_raw(&[HandshakeStatus::NotAvailable as u8])?;
            conn.close();
            return Ok(None);
        }

        let mut welcome = BytesMut::with_capacity(1 + WelcomeMessage::SIZE);
        welcome.put_u8(HandshakeStatus::Welcome as u8);
        self.shared.welcome.encode(&mut welcome);
        conn.send_raw(&welcome)?;
        Ok(Some(conn))
    }

    fn serve(&mut self, mut conn: Connection) -> Outcome {
        self.served = true;
        if let Some(broadcaster) = &mut self.broadcaster {
            broadcaster.stop();
        }
        info!(peer = %conn.peer(), "peer connected");
        if let Err(e) = self.connect(&mut conn) {
            return self.disconnect(conn, Some(e));
        }
        self.shared.set_state(TransportState::Streaming);

        let mut responder = QueryResponder::new(self.shared.config.code_transfer);
        let mut idle = 0;
        loop {
            if self.shared.shutdown_requested() {
                return self.shutdown(conn, &mut responder);
            }
            match self.cycle(&mut conn, &mut responder, &mut idle) {
                Ok(Step::Continue) => {}
                Ok(Step::Disconnect | Step::Terminate) => return self.disconnect(conn, None),
                Err(e) => return self.disconnect(conn, Some(e)),
            }
        }
    }

    /// Starts a fresh stream: stale records are dropped and retained
    /// metadata goes out first.
    fn connect(&mut self, conn: &mut Connection) -> Result<()> {
        let shared = self.shared.clone();
        shared.set_state(TransportState::Draining);
        let sticky = shared.sticky.lock();
        let discarded = self.clear();
        if shared.config.on_demand {
            conn.append_record(&Event::OnDemandPayload(OnDemandPayload {
                frames: shared.frame_count.load(Ordering::Relaxed),
                current_time: get_timestamp_ns(),
            }))?;
        }
        for entry in &sticky.entries {
            conn.append(entry.thread, &entry.event)?;
        }
        let replayed = sticky.entries.len();
        shared.connection_id.fetch_add(1, Ordering::AcqRel);
        // Still under the sticky lock: later sticky records are queued, not
        // replayed.
        shared.connected.store(true, Ordering::Release);
        drop(sticky);
        conn.flush()?;
        debug!(discarded, replayed, "stream started");
        Ok(())
    }

    /// One service-loop pass: drain, keep-alive or idle wait, then queries.
    fn cycle(
        &mut self,
        conn: &mut Connection,
        responder: &mut QueryResponder,
        idle: &mut u32,
    ) -> Result<Step> {
        if self.drain(conn, false)? > 0 {
            *idle = 0;
        } else {
            *idle += 1;
            if *idle >= KEEP_ALIVE_CYCLES {
                *idle = 0;
                conn.append_record(&Event::KeepAlive)?;
                conn.flush()?;
            } else {
                // Doubles as the idle sleep; returns early when a query arrives.
                conn.has_data(IDLE_WAIT_MS)?;
            }
        }
        self.service_queries(conn, responder)
    }

    /// Encodes and sends everything currently queued. Returns the number of
    /// records taken from the queues.
    fn drain(&mut self, conn: &mut Connection, shutting_down: bool) -> Result<usize> {
        let mut failure = None;
        let mut taken = self.consumer.drain(DRAIN_BUDGET, |tag, event| {
            if failure.is_none() {
                if let Err(e) = conn.append(tag as u32, &event) {
                    failure = Some(e);
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }

        if self.shared.serial.swap(&mut self.serial, SERIAL_LOCK_TIMEOUT) {
            taken += self.serial.len();
            for entry in self.serial.drain(..) {
                conn.append(entry.thread, &entry.event)?;
            }
        } else if shutting_down {
            warn!("serial queue lock not available, skipping pass");
        }

        conn.flush()?;
        Ok(taken)
    }

    fn service_queries(
        &mut self,
        conn: &mut Connection,
        responder: &mut QueryResponder,
    ) -> Result<Step> {
        while let Some(packet) = conn.poll_query()? {
            let action = responder.answer(
                &packet,
                &self.shared.names,
                self.shared.symbolizer.as_ref(),
            );
            match action {
                QueryAction::Reply(event) => conn.append_record(&event)?,
                QueryAction::Disconnect => {
                    conn.flush()?;
                    return Ok(Step::Disconnect);
                }
                QueryAction::Terminate => {
                    conn.flush()?;
                    return Ok(Step::Terminate);
                }
            }
        }
        conn.flush()?;
        Ok(Step::Continue)
    }

    fn disconnect(&mut self, conn: Connection, error: Option<AgentError>) -> Outcome {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_state(TransportState::Disconnected);
        match error {
            None | Some(AgentError::Disconnected) => {
                info!(peer = %conn.peer(), "peer disconnected")
            }
            Some(e) => warn!(peer = %conn.peer(), error = ?e, "connection lost"),
        }
        conn.close();
        Outcome::Disconnected
    }

    fn shutdown(&mut self, mut conn: Connection, responder: &mut QueryResponder) -> Outcome {
        self.shared.set_state(TransportState::ShuttingDown);
        let deadline = (!self.shared.config.no_exit)
            .then(|| Instant::now() + self.shared.config.shutdown_timeout());
        match self.final_flush(&mut conn, responder, deadline) {
            Ok(()) => info!(peer = %conn.peer(), sent = conn.sent_bytes(), "stream closed"),
            Err(e) => debug!(peer = %conn.peer(), error = ?e, "final flush interrupted"),
        }
        self.shared.connected.store(false, Ordering::Release);
        conn.close();
        Outcome::Finished
    }

    /// Sends what is queued, then `Terminate`, and serves queries until the
    /// peer acknowledges or hangs up. `deadline` bounds the whole sequence.
    fn final_flush(
        &mut self,
        conn: &mut Connection,
        responder: &mut QueryResponder,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let expired = |deadline: Option<Instant>| deadline.is_some_and(|d| Instant::now() >= d);

        while self.drain(conn, true)? > 0 {
            if expired(deadline) {
                warn!("shutdown timeout reached while draining");
                return Ok(());
            }
        }
        conn.append_record(&Event::Terminate)?;
        conn.flush()?;

        loop {
            if expired(deadline) {
                warn!("peer did not acknowledge terminate");
                return Ok(());
            }
            // Nothing recorded after the terminate record is sent.
            self.clear();
            match self.service_queries(conn, responder) {
                Ok(Step::Continue) => {}
                Ok(Step::Disconnect | Step::Terminate) | Err(AgentError::Disconnected) => {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
            conn.has_data(IDLE_WAIT_MS)?;
        }
    }
}
