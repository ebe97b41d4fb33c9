use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{EventSink, Result, SystemSampler};

const IDLE_SLEEP: Duration = Duration::from_millis(1);
const INACTIVE_SLEEP: Duration = Duration::from_millis(10);

/// Dedicated thread polling a [`SystemSampler`] until shutdown is requested.
pub struct SamplerThread {
    shutdown: Arc<AtomicBool>,
    tid: Arc<AtomicI32>,
    handle: Option<JoinHandle<()>>,
}

impl SamplerThread {
    /// Starts the thread. `shutdown` is polled between passes; setting it
    /// stops the thread after the current pass.
    pub fn spawn<S>(
        mut sampler: Box<dyn SystemSampler>,
        mut sink: S,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self>
    where
        S: EventSink + Send + 'static,
    {
        let tid = Arc::new(AtomicI32::new(0));
        let thread_tid = tid.clone();
        let thread_shutdown = shutdown.clone();

        let handle = thread::Builder::new()
            .name("streamtrace-sampling".into())
            .spawn(move || {
                thread_tid.store(nix::unistd::gettid().as_raw(), Ordering::Release);
                if let Err(e) = sampler.start() {
                    warn!(sampler = sampler.name(), error = ?e, "failed to start sampler");
                    return;
                }
                debug!(sampler = sampler.name(), "sampling thread started");

                while !thread_shutdown.load(Ordering::Relaxed) {
                    match sampler.poll_once(&mut sink) {
                        Ok(true) => {}
                        Ok(false) if sink.is_active() => thread::sleep(IDLE_SLEEP),
                        Ok(false) => thread::sleep(INACTIVE_SLEEP),
                        Err(e) => {
                            warn!(error = ?e, "sampler poll failed, stopping");
                            break;
                        }
                    }
                }

                sampler.stop();
                debug!("sampling thread exiting");
            })?;

        Ok(SamplerThread {
            shutdown,
            tid,
            handle: Some(handle),
        })
    }

    /// Kernel thread id, once the thread is running.
    pub fn tid(&self) -> Option<i32> {
        match self.tid.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    /// Shared handle to the thread id, for code that must recognise the
    /// sampling thread without owning it.
    pub fn tid_handle(&self) -> Arc<AtomicI32> {
        self.tid.clone()
    }

    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sampling thread panicked");
            }
        }
    }
}

impl Drop for SamplerThread {
    fn drop(&mut self) {
        self.join();
    }
}
