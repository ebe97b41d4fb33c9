//! System-wide sampling sources feeding the event pipeline.
//!
//! A [`SystemSampler`] owns a set of kernel sampling sources and turns their
//! records into protocol [`Event`]s handed to an [`EventSink`]. On Linux the
//! sources are perf-event rings, one per cpu and event kind. Everywhere else,
//! or when nothing can be opened, [`NoopSampler`] stands in so the rest of the
//! pipeline never has to care whether system tracing exists.

pub mod callstack;
pub mod config;
pub mod merge;
pub mod noop;
#[cfg(target_os = "linux")]
pub mod perf;
pub mod sched;
pub mod worker;

pub use config::SamplerConfig;
pub use merge::{drain_ring, OrderedMerge, TimestampedRing};
pub use noop::NoopSampler;
pub use worker::SamplerThread;

use protocol::Event;
use tracing::{debug, warn};

pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum SysTraceError {
        #[error("io error: {0}")]
        Io(#[from] std::io::Error),
        #[error("system call failed: {0}")]
        Nix(#[from] nix::Error),
        #[error("unknown hardware counter: {0}")]
        UnknownCounter(String),
        #[error("tracepoint {0} not available")]
        MissingTracepoint(&'static str),
        #[error("none of the {0} opened rings could be enabled")]
        NoneEnabled(usize),
        #[error("failed to open perf event for {what} on cpu {cpu}: {source}")]
        Open {
            what: &'static str,
            cpu: u32,
            source: std::io::Error,
        },
    }
}

pub use error::SysTraceError;

pub type Result<T> = std::result::Result<T, SysTraceError>;

/// Destination for normalised samples.
pub trait EventSink {
    fn emit(&mut self, event: Event);

    /// False while nobody consumes the events; samplers then advance their
    /// sources without decoding.
    fn is_active(&self) -> bool {
        true
    }
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// One platform's kernel sampling facility.
pub trait SystemSampler: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// Reads everything currently pending. Returns whether any source had
    /// data, so the caller can back off when idle.
    fn poll_once(&mut self, sink: &mut dyn EventSink) -> Result<bool>;

    /// Period of the callstack sampling clock, zero when not sampling.
    fn sampling_period_ns(&self) -> u64 {
        0
    }
}

/// Picks the best sampler this process can open.
pub fn detect(config: &SamplerConfig) -> Box<dyn SystemSampler> {
    if !config.enabled {
        debug!("system tracing disabled");
        return Box::new(NoopSampler);
    }

    #[cfg(target_os = "linux")]
    match perf::PerfSampler::open(config) {
        Ok(sampler) if sampler.ring_count() > 0 => {
            debug!(rings = sampler.ring_count(), "perf sampling available");
            return Box::new(sampler);
        }
        Ok(_) => debug!("no perf rings could be opened"),
        Err(e) => warn!(error = ?e, "perf sampling unavailable"),
    }

    Box::new(NoopSampler)
}
