use protocol::HwCounter;
use serde::{Deserialize, Serialize};

use crate::{Result, SysTraceError};

pub const PERF_TYPE_HARDWARE: u32 = 0;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

/// A hardware counter resolved to its perf encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSpec {
    pub counter: HwCounter,
    pub perf_type: u32,
    pub config: u64,
}

/// Resolves a counter name as accepted in the `counters` list.
pub fn resolve_counter(name: &str) -> Result<CounterSpec> {
    let (counter, config) = match name {
        "cpu-cycles" | "cycles" => (HwCounter::CpuCycles, PERF_COUNT_HW_CPU_CYCLES),
        "cpu-instructions" | "instructions" => {
            (HwCounter::Instructions, PERF_COUNT_HW_INSTRUCTIONS)
        }
        "cache-references" => (HwCounter::CacheReference, PERF_COUNT_HW_CACHE_REFERENCES),
        "cache-misses" => (HwCounter::CacheMiss, PERF_COUNT_HW_CACHE_MISSES),
        "branch-instructions" | "branches" => {
            (HwCounter::BranchRetired, PERF_COUNT_HW_BRANCH_INSTRUCTIONS)
        }
        "branch-misses" => (HwCounter::BranchMiss, PERF_COUNT_HW_BRANCH_MISSES),
        _ => return Err(SysTraceError::UnknownCounter(name.to_string())),
    };
    Ok(CounterSpec {
        counter,
        perf_type: PERF_TYPE_HARDWARE,
        config,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Software clock sampling with call stacks.
    #[serde(default = "default_true")]
    pub callstack_sampling: bool,
    #[serde(default = "default_sampling_hz")]
    pub sampling_hz: u64,
    #[serde(default = "default_counters")]
    pub counters: Vec<String>,
    #[serde(default = "default_hw_frequency")]
    pub hw_frequency: u64,
    #[serde(default = "default_true")]
    pub context_switch: bool,
    #[serde(default = "default_true")]
    pub wakeup: bool,
    #[serde(default = "default_true")]
    pub vsync: bool,
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,
    #[serde(default = "default_context_switch_ring_size")]
    pub context_switch_ring_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_sampling_hz() -> u64 {
    10_000
}

fn default_hw_frequency() -> u64 {
    5_000
}

fn default_counters() -> Vec<String> {
    [
        "cpu-cycles",
        "instructions",
        "cache-references",
        "cache-misses",
        "branch-instructions",
        "branch-misses",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_ring_size() -> usize {
    64 * 1024
}

fn default_context_switch_ring_size() -> usize {
    256 * 1024
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            callstack_sampling: true,
            sampling_hz: default_sampling_hz(),
            counters: default_counters(),
            hw_frequency: default_hw_frequency(),
            context_switch: true,
            wakeup: true,
            vsync: true,
            ring_size: default_ring_size(),
            context_switch_ring_size: default_context_switch_ring_size(),
        }
    }
}

impl SamplerConfig {
    /// Resolves every configured counter, failing on the first unknown name.
    pub fn validate(&self) -> Result<Vec<CounterSpec>> {
        let mut specs: Vec<CounterSpec> = Vec::with_capacity(self.counters.len());
        for name in &self.counters {
            let spec = resolve_counter(name)?;
            if !specs.iter().any(|s| s.counter == spec.counter) {
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Drops configured counters for which `keep` returns false. Unknown
    /// names are left for [`validate`](Self::validate) to report.
    pub fn retain_counters(&mut self, mut keep: impl FnMut(HwCounter) -> bool) {
        self.counters.retain(|name| match resolve_counter(name) {
            Ok(spec) => keep(spec.counter),
            Err(_) => true,
        });
    }

    pub fn sampling_period_ns(&self) -> u64 {
        if self.callstack_sampling && self.sampling_hz > 0 {
            1_000_000_000 / self.sampling_hz
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_counters_resolve() {
        let config = SamplerConfig::default();
        let specs = config.validate().unwrap();
        assert_eq!(specs.len(), 6);
        assert_eq!(specs[0].counter, HwCounter::CpuCycles);
        assert_eq!(specs[5].counter, HwCounter::BranchMiss);
    }

    #[rstest]
    #[case::alias("cycles", HwCounter::CpuCycles, PERF_COUNT_HW_CPU_CYCLES)]
    #[case::instructions("cpu-instructions", HwCounter::Instructions, PERF_COUNT_HW_INSTRUCTIONS)]
    #[case::branches("branches", HwCounter::BranchRetired, PERF_COUNT_HW_BRANCH_INSTRUCTIONS)]
    fn test_counter_names(#[case] name: &str, #[case] counter: HwCounter, #[case] config: u64) {
        let spec = resolve_counter(name).unwrap();
        assert_eq!(spec.counter, counter);
        assert_eq!(spec.config, config);
        assert_eq!(spec.perf_type, PERF_TYPE_HARDWARE);
    }

    #[test]
    fn test_unknown_counter_rejected() {
        let config = SamplerConfig {
            counters: vec!["cpu-cycles".into(), "bogus".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SysTraceError::UnknownCounter(name)) if name == "bogus"
        ));
    }

    #[test]
    fn test_duplicates_collapse() {
        let config = SamplerConfig {
            counters: vec!["cycles".into(), "cpu-cycles".into()],
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().len(), 1);
    }

    #[test]
    fn test_retain_counters() {
        let mut config = SamplerConfig::default();
        config.retain_counters(|c| !matches!(c, HwCounter::CacheReference | HwCounter::CacheMiss));
        let specs = config.validate().unwrap();
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.counter != HwCounter::CacheMiss));
    }

    #[test]
    fn test_sampling_period() {
        let mut config = SamplerConfig::default();
        assert_eq!(config.sampling_period_ns(), 100_000);
        config.callstack_sampling = false;
        assert_eq!(config.sampling_period_ns(), 0);
    }
}
