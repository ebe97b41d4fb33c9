//! Linux perf-event sampler.

pub mod attr;
pub mod ring;

use protocol::HwCounter;
use tracing::{debug, warn};

use attr::{
    perf_event_open, possible_cpus, tracepoint_id, PerfEventAttr, PERF_COUNT_SW_CPU_CLOCK,
    PERF_SAMPLE_CALLCHAIN, PERF_SAMPLE_IP, PERF_SAMPLE_RAW, PERF_SAMPLE_TID, PERF_SAMPLE_TIME,
    PERF_TYPE_SOFTWARE, PERF_TYPE_TRACEPOINT,
};
use ring::{PerfMmap, PerfRing, RingKind, RingMemory};

use crate::merge::{drain_ring, skip_ring, OrderedMerge};
use crate::{EventSink, Result, SamplerConfig, SysTraceError, SystemSampler};

const MAX_STACK: u16 = 127;

pub struct PerfSampler {
    /// Rings read one at a time.
    rings: Vec<PerfRing<PerfMmap>>,
    /// Rings whose records must come out globally ordered.
    merged: Vec<PerfRing<PerfMmap>>,
    merge: OrderedMerge,
    sampling_period_ns: u64,
}

impl PerfSampler {
    /// Opens every ring the configuration asks for. Rings that fail to open
    /// are left out; the result may have none at all.
    pub fn open(config: &SamplerConfig) -> Result<Self> {
        let counters = config.validate()?;
        let cpus = possible_cpus();
        let pid = std::process::id() as i32;
        let mut sampler = PerfSampler {
            rings: Vec::new(),
            merged: Vec::new(),
            merge: OrderedMerge::new(),
            sampling_period_ns: 0,
        };

        if config.callstack_sampling && config.sampling_hz > 0 {
            let attr = PerfEventAttr::new(
                PERF_TYPE_SOFTWARE,
                PERF_COUNT_SW_CPU_CLOCK,
                PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CALLCHAIN,
            )
            .frequency(config.sampling_hz)
            .inherit()
            .max_stack(MAX_STACK);
            let opened = sampler.open_per_cpu(
                &attr,
                pid,
                cpus,
                RingKind::Callstack,
                config.ring_size,
                |attr| {
                    debug!("no access to kernel samples, retrying user only");
                    Some(attr.exclude_kernel())
                },
            );
            if opened > 0 {
                sampler.sampling_period_ns = config.sampling_period_ns();
            }
        }

        for spec in &counters {
            let attr = PerfEventAttr::new(
                spec.perf_type,
                spec.config,
                PERF_SAMPLE_IP | PERF_SAMPLE_TIME,
            )
            .frequency(config.hw_frequency)
            .user_only()
            .inherit();
            let kind = RingKind::Hardware(spec.counter);
            sampler.open_per_cpu(&attr, pid, cpus, kind, config.ring_size, |_| None);
        }

        if config.vsync {
            match tracepoint_id("drm", "drm_vblank_event") {
                Some(id) => {
                    let attr = PerfEventAttr::new(
                        PERF_TYPE_TRACEPOINT,
                        id,
                        PERF_SAMPLE_TIME | PERF_SAMPLE_RAW,
                    )
                    .period(1);
                    let size = config.ring_size;
                    sampler.open_per_cpu(&attr, -1, cpus, RingKind::Vsync, size, |_| None);
                }
                None => debug!("{}", SysTraceError::MissingTracepoint("drm_vblank_event")),
            }
        }

        if config.context_switch {
            match tracepoint_id("sched", "sched_switch") {
                Some(id) => {
                    let attr = PerfEventAttr::new(
                        PERF_TYPE_TRACEPOINT,
                        id,
                        PERF_SAMPLE_TIME | PERF_SAMPLE_RAW | PERF_SAMPLE_CALLCHAIN,
                    )
                    .period(1)
                    .inherit()
                    .max_stack(MAX_STACK);
                    sampler.open_per_cpu(
                        &attr,
                        -1,
                        cpus,
                        RingKind::ContextSwitch,
                        config.context_switch_ring_size,
                        |_| None,
                    );
                }
                None => debug!("{}", SysTraceError::MissingTracepoint("sched_switch")),
            }

            if config.wakeup {
                if let Some(id) = tracepoint_id("sched", "sched_wakeup") {
                    let attr = PerfEventAttr::new(
                        PERF_TYPE_TRACEPOINT,
                        id,
                        PERF_SAMPLE_TIME | PERF_SAMPLE_RAW,
                    )
                    .period(1)
                    .inherit();
                    let size = config.ring_size;
                    sampler.open_per_cpu(&attr, -1, cpus, RingKind::Wakeup, size, |_| None);
                }
            }
        }

        debug!(
            rings = sampler.rings.len(),
            merged = sampler.merged.len(),
            "perf rings in use"
        );
        Ok(sampler)
    }

    /// Opens one ring per cpu, returning how many succeeded. `fallback` may
    /// offer a weaker attribute set to retry with after a failed open; once
    /// it is used it sticks for the remaining cpus.
    fn open_per_cpu(
        &mut self,
        attr: &PerfEventAttr,
        pid: i32,
        cpus: u32,
        kind: RingKind,
        ring_size: usize,
        mut fallback: impl FnMut(PerfEventAttr) -> Option<PerfEventAttr>,
    ) -> usize {
        let mut attr = *attr;
        let mut opened = 0;
        for cpu in 0..cpus {
            let fd = match perf_event_open(&attr, pid, cpu as i32) {
                Ok(fd) => fd,
                Err(first) => {
                    let retried = fallback(attr).and_then(|weaker| {
                        attr = weaker;
                        perf_event_open(&attr, pid, cpu as i32).ok()
                    });
                    match retried {
                        Some(fd) => fd,
                        None => {
                            let error = SysTraceError::Open {
                                what: kind_name(kind),
                                cpu,
                                source: first,
                            };
                            debug!(%error, "ring unavailable");
                            continue;
                        }
                    }
                }
            };
            match PerfMmap::new(fd, ring_size) {
                Ok(memory) => {
                    let ring = PerfRing::new(memory, kind, cpu);
                    if kind.is_merged() {
                        self.merged.push(ring);
                    } else {
                        self.rings.push(ring);
                    }
                    opened += 1;
                }
                Err(e) => warn!(cpu, error = ?e, "failed to map perf ring"),
            }
        }
        opened
    }

    pub fn ring_count(&self) -> usize {
        self.rings.len() + self.merged.len()
    }

    fn all_rings(&self) -> impl Iterator<Item = &PerfRing<PerfMmap>> {
        self.rings.iter().chain(self.merged.iter())
    }
}

/// Enables each ring and drops the ones the kernel refuses. Returns how many
/// were dropped.
fn retain_enabled<M: RingMemory>(rings: &mut Vec<PerfRing<M>>) -> usize {
    let before = rings.len();
    rings.retain(|ring| match ring.memory().enable() {
        Ok(()) => true,
        Err(e) => {
            warn!(
                kind = kind_name(ring.kind()),
                cpu = ring.cpu(),
                error = ?e,
                "failed to enable ring"
            );
            false
        }
    });
    before - rings.len()
}

fn kind_name(kind: RingKind) -> &'static str {
    match kind {
        RingKind::Callstack => "callstack sampling",
        RingKind::Hardware(HwCounter::CpuCycles) => "cpu cycles",
        RingKind::Hardware(HwCounter::Instructions) => "instructions retired",
        RingKind::Hardware(HwCounter::CacheReference) => "cache references",
        RingKind::Hardware(HwCounter::CacheMiss) => "cache misses",
        RingKind::Hardware(HwCounter::BranchRetired) => "branches retired",
        RingKind::Hardware(HwCounter::BranchMiss) => "branch misses",
        RingKind::ContextSwitch => "context switches",
        RingKind::Wakeup => "wakeups",
        RingKind::Vsync => "vsync",
    }
}

impl SystemSampler for PerfSampler {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn start(&mut self) -> Result<()> {
        let opened = self.ring_count();
        let dropped = retain_enabled(&mut self.rings) + retain_enabled(&mut self.merged);
        if dropped > 0 {
            debug!(dropped, remaining = self.ring_count(), "rings left out");
        }
        if opened > 0 && self.ring_count() == 0 {
            return Err(SysTraceError::NoneEnabled(opened));
        }
        Ok(())
    }

    fn stop(&mut self) {
        for ring in self.all_rings() {
            let _ = ring.memory().disable();
        }
    }

    fn poll_once(&mut self, sink: &mut dyn EventSink) -> Result<bool> {
        if !sink.is_active() {
            for ring in self.rings.iter_mut().chain(self.merged.iter_mut()) {
                skip_ring(ring);
            }
            return Ok(false);
        }

        let mut had_data = false;
        for ring in &mut self.rings {
            had_data |= drain_ring(ring, sink) > 0;
        }
        had_data |= self.merge.pass(&mut self.merged, sink) > 0;
        Ok(had_data)
    }

    fn sampling_period_ns(&self) -> u64 {
        self.sampling_period_ns
    }
}
