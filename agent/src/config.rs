use protocol::HwCounter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use systrace::SamplerConfig;
use tracing::debug;

use crate::{AgentError, Result};

pub const CONFIG_ENV: &str = "STREAMTRACE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fixed listen port. When unset the first free port of the default
    /// range is used.
    #[serde(default)]
    pub port: Option<u16>,
    /// Only stream while a peer is connected and replay sticky metadata to
    /// every new peer.
    #[serde(default)]
    pub on_demand: bool,
    /// Keep the process alive at shutdown until a peer has collected the
    /// remaining data.
    #[serde(default)]
    pub no_exit: bool,
    #[serde(default = "default_true")]
    pub broadcast: bool,
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    #[serde(default)]
    pub only_localhost: bool,
    #[serde(default)]
    pub only_ipv4: bool,
    #[serde(default = "default_true")]
    pub code_transfer: bool,
    #[serde(default = "default_true")]
    pub invariant_check: bool,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Slots per block of each thread's event queue.
    #[serde(default = "default_queue_block")]
    pub queue_block: usize,
    /// Upper bound on metadata retained for replay.
    #[serde(default = "default_sticky_limit")]
    pub sticky_limit: usize,
    #[serde(default)]
    pub program_name: Option<String>,
    #[serde(default)]
    pub systrace: SamplerConfig,
}

fn default_true() -> bool {
    true
}

fn default_broadcast_port() -> u16 {
    protocol::broadcast::DEFAULT_BROADCAST_PORT
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

fn default_queue_block() -> usize {
    4096
}

fn default_sticky_limit() -> usize {
    16 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            on_demand: false,
            no_exit: false,
            broadcast: true,
            broadcast_port: default_broadcast_port(),
            only_localhost: false,
            only_ipv4: false,
            code_transfer: true,
            invariant_check: true,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            queue_block: default_queue_block(),
            sticky_limit: default_sticky_limit(),
            program_name: None,
            systrace: SamplerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = toml::from_str(&text)?;
        debug!(path = %path.as_ref().display(), "loaded config");
        Ok(config)
    }

    /// Defaults, or the file named by `STREAMTRACE_CONFIG`, with the
    /// environment applied on top.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Applies `STREAMTRACE_*` overrides read through `lookup`.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let flag = |name: &str| lookup(name).is_some_and(|v| v == "1");

        if let Some(value) = lookup("STREAMTRACE_PORT") {
            let port = value.parse().map_err(|_| AgentError::InvalidEnv {
                var: "STREAMTRACE_PORT",
                value: value.clone(),
            })?;
            self.port = Some(port);
        }
        if let Some(value) = lookup("STREAMTRACE_SAMPLING_HZ") {
            self.systrace.sampling_hz = value.parse().map_err(|_| AgentError::InvalidEnv {
                var: "STREAMTRACE_SAMPLING_HZ",
                value: value.clone(),
            })?;
        }

        if flag("STREAMTRACE_ON_DEMAND") {
            self.on_demand = true;
        }
        if flag("STREAMTRACE_NO_EXIT") {
            self.no_exit = true;
        }
        if flag("STREAMTRACE_NO_BROADCAST") {
            self.broadcast = false;
        }
        if flag("STREAMTRACE_ONLY_LOCALHOST") {
            self.only_localhost = true;
        }
        if flag("STREAMTRACE_ONLY_IPV4") {
            self.only_ipv4 = true;
        }
        if flag("STREAMTRACE_NO_CODE_TRANSFER") {
            self.code_transfer = false;
        }
        if flag("STREAMTRACE_NO_INVARIANT_CHECK") {
            self.invariant_check = false;
        }
        if flag("STREAMTRACE_NO_CONTEXT_SWITCH") {
            self.systrace.context_switch = false;
            self.systrace.wakeup = false;
        }
        if flag("STREAMTRACE_NO_VSYNC_CAPTURE") {
            self.systrace.vsync = false;
        }
        if flag("STREAMTRACE_NO_SAMPLING") {
            self.systrace.callstack_sampling = false;
        }
        if flag("STREAMTRACE_NO_SAMPLE_RETIREMENT") {
            self.systrace
                .retain_counters(|c| !matches!(c, HwCounter::CpuCycles | HwCounter::Instructions));
        }
        if flag("STREAMTRACE_NO_SAMPLE_CACHE") {
            self.systrace.retain_counters(|c| {
                !matches!(c, HwCounter::CacheReference | HwCounter::CacheMiss)
            });
        }
        if flag("STREAMTRACE_NO_SAMPLE_BRANCH") {
            self.systrace
                .retain_counters(|c| !matches!(c, HwCounter::BranchRetired | HwCounter::BranchMiss));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[rstest]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, None);
        assert!(!config.on_demand);
        assert!(config.broadcast);
        assert!(config.code_transfer);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(config.systrace.counters.len(), 6);
    }

    #[rstest]
    fn test_load_partial_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9000\non_demand = true\n\n[systrace]\nvsync = false\nsampling_hz = 500"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, Some(9000));
        assert!(config.on_demand);
        assert!(config.broadcast);
        assert!(!config.systrace.vsync);
        assert!(config.systrace.context_switch);
        assert_eq!(config.systrace.sampling_hz, 500);
    }

    #[rstest]
    fn test_load_rejects_bad_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(AgentError::Config(_))
        ));
    }

    #[rstest]
    #[case("STREAMTRACE_ON_DEMAND", |c: &Config| c.on_demand)]
    #[case("STREAMTRACE_NO_EXIT", |c: &Config| c.no_exit)]
    #[case("STREAMTRACE_NO_BROADCAST", |c: &Config| !c.broadcast)]
    #[case("STREAMTRACE_ONLY_LOCALHOST", |c: &Config| c.only_localhost)]
    #[case("STREAMTRACE_ONLY_IPV4", |c: &Config| c.only_ipv4)]
    #[case("STREAMTRACE_NO_CODE_TRANSFER", |c: &Config| !c.code_transfer)]
    #[case("STREAMTRACE_NO_INVARIANT_CHECK", |c: &Config| !c.invariant_check)]
    #[case("STREAMTRACE_NO_CONTEXT_SWITCH", |c: &Config| !c.systrace.context_switch && !c.systrace.wakeup)]
    #[case("STREAMTRACE_NO_VSYNC_CAPTURE", |c: &Config| !c.systrace.vsync)]
    #[case("STREAMTRACE_NO_SAMPLING", |c: &Config| !c.systrace.callstack_sampling)]
    fn test_boolean_overrides(#[case] var: &str, #[case] check: fn(&Config) -> bool) {
        let mut config = Config::default();
        config.apply_vars(vars(&[(var, "1")])).unwrap();
        assert!(check(&config), "{var} not applied");

        let mut untouched = Config::default();
        untouched.apply_vars(vars(&[(var, "0")])).unwrap();
        assert!(!check(&untouched), "{var}=0 must not apply");
    }

    #[rstest]
    fn test_counter_groups() {
        let mut config = Config::default();
        config
            .apply_vars(vars(&[
                ("STREAMTRACE_NO_SAMPLE_CACHE", "1"),
                ("STREAMTRACE_NO_SAMPLE_BRANCH", "1"),
            ]))
            .unwrap();
        let counters: Vec<HwCounter> = config
            .systrace
            .validate()
            .unwrap()
            .into_iter()
            .map(|s| s.counter)
            .collect();
        assert_eq!(counters, vec![HwCounter::CpuCycles, HwCounter::Instructions]);

        config
            .apply_vars(vars(&[("STREAMTRACE_NO_SAMPLE_RETIREMENT", "1")]))
            .unwrap();
        assert!(config.systrace.counters.is_empty());
    }

    #[rstest]
    fn test_numeric_overrides() {
        let mut config = Config::default();
        config
            .apply_vars(vars(&[
                ("STREAMTRACE_PORT", "8200"),
                ("STREAMTRACE_SAMPLING_HZ", "250"),
            ]))
            .unwrap();
        assert_eq!(config.port, Some(8200));
        assert_eq!(config.systrace.sampling_hz, 250);

        let err = config
            .apply_vars(vars(&[("STREAMTRACE_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidEnv {
                var: "STREAMTRACE_PORT",
                ..
            }
        ));
    }

    #[rstest]
    #[serial]
    fn test_from_env_reads_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "port = 9100\nbroadcast = false").unwrap();

        std::env::set_var(CONFIG_ENV, file.path());
        std::env::set_var("STREAMTRACE_PORT", "9101");
        let config = Config::from_env();
        std::env::remove_var(CONFIG_ENV);
        std::env::remove_var("STREAMTRACE_PORT");

        let config = config.unwrap();
        assert_eq!(config.port, Some(9101));
        assert!(!config.broadcast);
    }
}
