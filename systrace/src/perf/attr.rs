//! `perf_event_open(2)` plumbing.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::Result;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;

pub const PERF_RECORD_SAMPLE: u32 = 9;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

/// Size of the fifth revision of the attribute struct, which is all we fill.
pub const PERF_ATTR_SIZE_VER5: u32 = 112;

const FLAG_DISABLED: u64 = 1 << 0;
const FLAG_INHERIT: u64 = 1 << 1;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const FLAG_EXCLUDE_HV: u64 = 1 << 6;
const FLAG_FREQ: u64 = 1 << 10;
const FLAG_EXCLUDE_GUEST: u64 = 1 << 20;
const FLAG_USE_CLOCKID: u64 = 1 << 25;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// Period, or frequency when the `freq` flag is set.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved: u16,
}

unsafe impl plain::Plain for PerfEventAttr {}

const _: () = assert!(std::mem::size_of::<PerfEventAttr>() == PERF_ATTR_SIZE_VER5 as usize);

impl PerfEventAttr {
    /// Disabled at open, timestamps on the monotonic clock.
    pub fn new(type_: u32, config: u64, sample_type: u64) -> Self {
        PerfEventAttr {
            type_,
            size: PERF_ATTR_SIZE_VER5,
            config,
            sample_type,
            flags: FLAG_DISABLED | FLAG_USE_CLOCKID,
            clockid: libc::CLOCK_MONOTONIC,
            ..Default::default()
        }
    }

    pub fn frequency(mut self, hz: u64) -> Self {
        self.sample_period = hz;
        self.flags |= FLAG_FREQ;
        self
    }

    pub fn period(mut self, period: u64) -> Self {
        self.sample_period = period;
        self.flags &= !FLAG_FREQ;
        self
    }

    pub fn inherit(mut self) -> Self {
        self.flags |= FLAG_INHERIT;
        self
    }

    pub fn user_only(mut self) -> Self {
        self.flags |= FLAG_EXCLUDE_KERNEL | FLAG_EXCLUDE_HV | FLAG_EXCLUDE_GUEST;
        self
    }

    pub fn exclude_kernel(mut self) -> Self {
        self.flags |= FLAG_EXCLUDE_KERNEL;
        self
    }

    pub fn max_stack(mut self, depth: u16) -> Self {
        self.sample_max_stack = depth;
        self
    }
}

/// Opens a perf event for `pid` (-1 for every process) on `cpu`.
pub fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32) -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn ioctl(fd: &OwnedFd, request: libc::c_ulong) -> Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request as _, 0) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

pub fn enable(fd: &OwnedFd) -> Result<()> {
    ioctl(fd, PERF_EVENT_IOC_ENABLE)
}

pub fn disable(fd: &OwnedFd) -> Result<()> {
    ioctl(fd, PERF_EVENT_IOC_DISABLE)
}

/// Numeric id of a tracepoint, looked up in tracefs.
pub fn tracepoint_id(category: &str, name: &str) -> Option<u64> {
    ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"]
        .iter()
        .find_map(|root| {
            let path = format!("{}/events/{}/{}/id", root, category, name);
            std::fs::read_to_string(path).ok()?.trim().parse().ok()
        })
}

pub fn possible_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_builder() {
        let attr = PerfEventAttr::new(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK, PERF_SAMPLE_TIME)
            .frequency(1000)
            .inherit();
        assert_eq!(attr.size, PERF_ATTR_SIZE_VER5);
        assert_eq!(attr.sample_period, 1000);
        assert_ne!(attr.flags & FLAG_FREQ, 0);
        assert_ne!(attr.flags & FLAG_DISABLED, 0);
        assert_ne!(attr.flags & FLAG_INHERIT, 0);
        assert_eq!(attr.clockid, libc::CLOCK_MONOTONIC);

        let attr = attr.period(1);
        assert_eq!(attr.flags & FLAG_FREQ, 0);
    }

    #[test]
    fn test_missing_tracepoint() {
        assert_eq!(tracepoint_id("no_such_category", "no_such_event"), None);
    }
}
