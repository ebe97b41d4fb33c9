//! Timer calibration reported to the peer in the welcome message.

use mpscbuf::Consumer;
use protocol::event::ZoneBegin;
use protocol::Event;
use tracing::{debug, warn};

use crate::{get_timestamp_ns, Result};

const DELAY_ROUNDS: usize = 5;
const DELAY_EVENTS: usize = 1024;
const RESOLUTION_SAMPLES: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Timestamps are already nanoseconds.
    pub timer_mul: f64,
    /// Cost of recording one event, in ns.
    pub delay: u64,
    /// Smallest observed clock step, in ns.
    pub resolution: u64,
}

/// Measures the clock and the enqueue path. Takes a few milliseconds.
pub fn calibrate() -> Result<Calibration> {
    let resolution = measure_resolution();
    let delay = measure_delay()?;
    debug!(delay, resolution, "timer calibrated");
    Ok(Calibration {
        timer_mul: 1.0,
        delay,
        resolution,
    })
}

fn measure_resolution() -> u64 {
    let mut best = u64::MAX;
    let mut prev = get_timestamp_ns();
    for _ in 0..RESOLUTION_SAMPLES {
        let now = get_timestamp_ns();
        let step = (now - prev) as u64;
        if step > 0 && step < best {
            best = step;
        }
        prev = now;
    }
    if best == u64::MAX {
        1
    } else {
        best
    }
}

/// Best of several rounds of pushing zone records into a scratch queue.
fn measure_delay() -> Result<u64> {
    let mut consumer = Consumer::<Event>::new(DELAY_EVENTS)?;
    let mut producer = consumer.registry().producer(0);
    let mut best = u64::MAX;

    for _ in 0..DELAY_ROUNDS {
        let start = get_timestamp_ns();
        for i in 0..DELAY_EVENTS {
            producer.push(Event::ZoneBegin(ZoneBegin {
                time: get_timestamp_ns(),
                srcloc: i as u64,
            }));
        }
        let elapsed = (get_timestamp_ns() - start) as u64;
        best = best.min(elapsed / DELAY_EVENTS as u64);
        consumer.clear();
    }
    Ok(best)
}

/// Whether the cpu advertises a constant-rate TSC. The monotonic clock is
/// derived from it on x86_64, so a missing flag means drifting timestamps.
pub fn invariant_tsc() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::__cpuid;
        let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_extended < 0x8000_0007 {
            return false;
        }
        unsafe { __cpuid(0x8000_0007) }.edx & (1 << 8) != 0
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        true
    }
}

pub(crate) fn check_invariant_clock(enabled: bool) {
    if enabled && !invariant_tsc() {
        warn!("cpu lacks an invariant TSC, timestamps may drift (set STREAMTRACE_NO_INVARIANT_CHECK=1 to silence)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_calibration_values_are_sane() {
        let calibration = calibrate().unwrap();
        assert_eq!(calibration.timer_mul, 1.0);
        assert!(calibration.resolution >= 1);
        assert!(calibration.resolution < 1_000_000);
        assert!(calibration.delay < 1_000_000);
    }

    #[rstest]
    fn test_clock_is_monotonic() {
        let mut prev = get_timestamp_ns();
        for _ in 0..10_000 {
            let now = get_timestamp_ns();
            assert!(now >= prev);
            prev = now;
        }
    }
}
