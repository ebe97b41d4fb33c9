use protocol::handshake::CPU_MANUFACTURER_SIZE;
use protocol::CpuArch;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Static facts about the process and machine sent in the welcome message.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub program_name: String,
    pub host_info: String,
    pub pid: u64,
    /// Process start, seconds since the unix epoch.
    pub epoch: u64,
    /// Executable modification time, seconds since the unix epoch.
    pub exec_time: u64,
    pub cpu_arch: CpuArch,
    pub cpu_manufacturer: [u8; CPU_MANUFACTURER_SIZE],
    pub cpu_id: u32,
}

impl HostInfo {
    pub fn detect(program_name: Option<&str>) -> Self {
        let (cpu_manufacturer, cpu_id) = cpu_identification();
        HostInfo {
            program_name: program_name
                .map(str::to_owned)
                .unwrap_or_else(detect_program_name),
            host_info: describe_host(),
            pid: std::process::id() as u64,
            epoch: unix_seconds(SystemTime::now()),
            exec_time: std::env::current_exe()
                .and_then(std::fs::metadata)
                .and_then(|m| m.modified())
                .map(unix_seconds)
                .unwrap_or(0),
            cpu_arch: CpuArch::current(),
            cpu_manufacturer,
            cpu_id,
        }
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn detect_program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .or_else(|| {
            std::fs::read_to_string("/proc/self/comm")
                .ok()
                .map(|s| s.trim_end().to_owned())
        })
        .unwrap_or_else(|| "unknown".to_owned())
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_owned())
}

fn total_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

fn describe_host() -> String {
    let mut out = String::new();
    let release = read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default();
    let _ = writeln!(out, "OS: Linux {release}");
    let _ = writeln!(out, "Client: streamtrace {}", env!("CARGO_PKG_VERSION"));
    let user = std::env::var("USER").unwrap_or_else(|_| "(?)".to_owned());
    let hostname = read_trimmed("/proc/sys/kernel/hostname").unwrap_or_default();
    let _ = writeln!(out, "User: {user}@{hostname}");
    let _ = writeln!(out, "Arch: {}", std::env::consts::ARCH);
    if let Some(brand) = cpu_brand() {
        let _ = writeln!(out, "CPU: {brand}");
    }
    if let Ok(cores) = std::thread::available_parallelism() {
        let _ = writeln!(out, "CPU cores: {cores}");
    }
    if let Some(mb) = total_memory_mb() {
        let _ = writeln!(out, "RAM: {mb} MB");
    }
    out
}

#[cfg(target_arch = "x86_64")]
fn cpu_identification() -> ([u8; CPU_MANUFACTURER_SIZE], u32) {
    use std::arch::x86_64::__cpuid;
    let vendor = unsafe { __cpuid(0) };
    let mut manufacturer = [0u8; CPU_MANUFACTURER_SIZE];
    manufacturer[0..4].copy_from_slice(&vendor.ebx.to_le_bytes());
    manufacturer[4..8].copy_from_slice(&vendor.edx.to_le_bytes());
    manufacturer[8..12].copy_from_slice(&vendor.ecx.to_le_bytes());
    let signature = unsafe { __cpuid(1) }.eax;
    // Stepping, model and family with their extended fields folded in.
    let cpu_id = (signature & 0x0fff_0ff0) | (signature & 0xf);
    (manufacturer, cpu_id)
}

#[cfg(not(target_arch = "x86_64"))]
fn cpu_identification() -> ([u8; CPU_MANUFACTURER_SIZE], u32) {
    let mut manufacturer = [0u8; CPU_MANUFACTURER_SIZE];
    let name = std::env::consts::ARCH.as_bytes();
    let len = name.len().min(CPU_MANUFACTURER_SIZE);
    manufacturer[..len].copy_from_slice(&name[..len]);
    (manufacturer, 0)
}

fn cpu_brand() -> Option<String> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_detect_fills_identity() {
        let host = HostInfo::detect(None);
        assert!(!host.program_name.is_empty());
        assert_eq!(host.pid, std::process::id() as u64);
        assert!(host.epoch > 0);
        assert!(host.host_info.contains("OS: "));
        assert_eq!(host.cpu_arch, CpuArch::current());
    }

    #[rstest]
    fn test_program_name_override() {
        let host = HostInfo::detect(Some("render-server"));
        assert_eq!(host.program_name, "render-server");
    }

    #[cfg(target_arch = "x86_64")]
    #[rstest]
    fn test_vendor_string_is_printable() {
        let (vendor, _) = cpu_identification();
        assert!(vendor.iter().all(|b| b.is_ascii_graphic() || *b == 0));
    }
}
