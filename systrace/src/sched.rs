//! Scheduler tracepoint payloads.
//!
//! Raw tracepoint layouts are not ABI-stable, but these have not changed
//! since they were introduced.

use std::borrow::Cow;

/// Reason code attached to every context switch read from the scheduler.
pub const SWITCH_REASON: u8 = 100;

/// Maps the kernel `prev_state` bitmask onto the wait state codes carried by
/// context switch events.
pub fn thread_state(prev_state: i64) -> u8 {
    const STATES: [(i64, u8); 8] = [
        (0x0001, 104),
        (0x0002, 101),
        (0x0004, 105),
        (0x0008, 106),
        (0x0010, 108),
        (0x0020, 109),
        (0x0040, 110),
        (0x0080, 102),
    ];
    STATES
        .iter()
        .find(|(bit, _)| prev_state & bit != 0)
        .map_or(103, |&(_, state)| state)
}

fn comm_str(comm: &[u8]) -> Cow<'_, str> {
    let len = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..len])
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedSwitch {
    pub common: [u8; 8],
    pub prev_comm: [u8; 16],
    pub prev_pid: i32,
    pub prev_prio: i32,
    pub prev_state: i64,
    pub next_comm: [u8; 16],
    pub next_pid: i32,
    pub next_prio: i32,
}

unsafe impl plain::Plain for SchedSwitch {}

impl SchedSwitch {
    pub fn prev_comm_str(&self) -> Cow<'_, str> {
        comm_str(&self.prev_comm)
    }

    pub fn next_comm_str(&self) -> Cow<'_, str> {
        comm_str(&self.next_comm)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedWakeup {
    pub common: [u8; 8],
    pub comm: [u8; 16],
    pub pid: i32,
    pub prio: i32,
}

unsafe impl plain::Plain for SchedWakeup {}

impl SchedWakeup {
    pub fn comm_str(&self) -> Cow<'_, str> {
        comm_str(&self.comm)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmVblank {
    pub common: [u8; 8],
    pub crtc: i32,
    pub seq: u32,
}

unsafe impl plain::Plain for DrmVblank {}

/// Copies a raw tracepoint payload into `T`. The payload may be longer than
/// `T` (newer kernels append fields) but not shorter; it need not be aligned.
pub fn parse_raw<T: plain::Plain + Default>(raw: &[u8]) -> Option<T> {
    let mut value = T::default();
    plain::copy_from_bytes(&mut value, raw).ok()?;
    Some(value)
}

/// Whether `tid` belongs to this process.
pub fn owns_thread(tid: u32) -> bool {
    std::path::Path::new(&format!("/proc/self/task/{}", tid)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::running(0, 103)]
    #[case::interruptible(0x1, 104)]
    #[case::uninterruptible(0x2, 101)]
    #[case::stopped(0x4, 105)]
    #[case::traced(0x8, 106)]
    #[case::dead(0x10, 108)]
    #[case::zombie(0x20, 109)]
    #[case::parked(0x40, 110)]
    #[case::idle(0x80, 102)]
    #[case::lowest_bit_wins(0x81, 104)]
    #[case::unknown_bit(0x400, 103)]
    fn test_thread_state(#[case] prev_state: i64, #[case] expected: u8) {
        assert_eq!(thread_state(prev_state), expected);
    }

    #[test]
    fn test_parse_sched_switch() {
        let mut raw = vec![0u8; 68];
        raw[8..12].copy_from_slice(b"app\0");
        raw[24..28].copy_from_slice(&1234i32.to_ne_bytes());
        raw[32..40].copy_from_slice(&2i64.to_ne_bytes());
        raw[40..46].copy_from_slice(b"idle/0");
        raw[56..60].copy_from_slice(&0i32.to_ne_bytes());

        let switch: SchedSwitch = parse_raw(&raw).unwrap();
        assert_eq!(switch.prev_pid, 1234);
        assert_eq!(switch.prev_comm_str(), "app");
        assert_eq!(switch.next_comm_str(), "idle/0");
        assert_eq!(thread_state(switch.prev_state), 101);
    }

    #[test]
    fn test_parse_short_payload() {
        assert!(parse_raw::<SchedWakeup>(&[0u8; 16]).is_none());
        let mut raw = [0u8; 36];
        raw[24..28].copy_from_slice(&77i32.to_ne_bytes());
        assert_eq!(parse_raw::<SchedWakeup>(&raw).unwrap().pid, 77);
    }

    #[test]
    fn test_owns_thread() {
        assert!(owns_thread(std::process::id()));
        assert!(!owns_thread(u32::MAX));
    }
}
