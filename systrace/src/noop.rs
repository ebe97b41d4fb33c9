use crate::{EventSink, Result, SystemSampler};

/// Sampler for platforms or permission sets that provide nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

impl SystemSampler for NoopSampler {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn poll_once(&mut self, _sink: &mut dyn EventSink) -> Result<bool> {
        Ok(false)
    }
}
