//! In-process side of streamtrace.
//!
//! [`Agent::start`] builds the process-wide [`Profiler`] context, binds the
//! listening socket and spawns the transport thread (plus the system-tracing
//! thread when the platform offers one). Application threads record events
//! through cheap [`Profiler`] clones; each thread lazily gets its own queue
//! producer bound to that context.

use mpscbuf::MpscBufError;
use protocol::ProtocolError;
use systrace::SysTraceError;
use thiserror::Error;

mod broadcast;
pub mod config;
mod connection;
pub mod crash;
pub mod host;
mod listener;
mod producer;
pub mod profiler;
mod query;
mod queue;
pub mod registry;
mod sink;
pub mod symbolizer;
pub mod timer;
mod transport;

pub use config::Config;
pub use crash::CrashHandler;
pub use profiler::{Agent, Profiler, ZoneGuard, ZoneToken};
pub use registry::SourceLocationData;
pub use symbolizer::{NoSymbolizer, Symbolizer};
pub use transport::TransportState;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
    #[error("MPSC buffer error: {0}")]
    Mpscbuf(#[from] MpscBufError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("System tracing error: {0}")]
    SysTrace(#[from] SysTraceError),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("no free port in {first}..={last}")]
    NoFreePort { first: u16, last: u16 },
    #[error("peer disconnected")]
    Disconnected,
    #[error("crash handler already installed")]
    CrashHandlerInstalled,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// CLOCK_MONOTONIC in nanoseconds. Every event timestamp comes from here.
pub fn get_timestamp_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}
