//! Cleanup of raw kernel call chains before they leave the process.

/// Entries at or above this value are context markers the kernel interleaves
/// with return addresses (kernel/user/guest boundaries).
pub const PERF_CONTEXT_MAX: u64 = u64::MAX - 4095;

#[inline]
fn is_canonical(addr: u64) -> bool {
    let v = addr as i64;
    (v >> 63) == (v >> 47)
}

/// Sanitizes a call chain using the canonical-address rule of the build
/// target (x86-64 only).
pub fn sanitize(frames: &mut Vec<u64>) {
    sanitize_with(frames, cfg!(target_arch = "x86_64"));
}

/// Trailing non-canonical addresses are trimmed and interior ones zeroed
/// when `canonical_check` is set; context markers are always removed.
pub fn sanitize_with(frames: &mut Vec<u64>, canonical_check: bool) {
    if canonical_check {
        while frames.last().is_some_and(|&addr| !is_canonical(addr)) {
            frames.pop();
        }
        for addr in frames.iter_mut() {
            if !is_canonical(*addr) {
                *addr = 0;
            }
        }
    }
    frames.retain(|&addr| addr < PERF_CONTEXT_MAX);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const USER: u64 = 0x0000_5555_dead_beef;
    const KERNEL: u64 = 0xffff_ffff_8100_0000;
    const BAD: u64 = 0x0001_0000_0000_0000;
    const PERF_CONTEXT_USER: u64 = (-512i64) as u64;

    #[rstest]
    #[case::clean(vec![USER, KERNEL], vec![USER, KERNEL])]
    #[case::trailing(vec![USER, BAD, BAD], vec![USER])]
    #[case::interior(vec![USER, BAD, KERNEL], vec![USER, 0, KERNEL])]
    #[case::markers(vec![PERF_CONTEXT_USER, USER, PERF_CONTEXT_USER, KERNEL], vec![USER, KERNEL])]
    #[case::all_bad(vec![BAD, BAD], vec![])]
    fn test_sanitize(#[case] mut frames: Vec<u64>, #[case] expected: Vec<u64>) {
        sanitize_with(&mut frames, true);
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_markers_removed_without_canonical_check() {
        let mut frames = vec![BAD, PERF_CONTEXT_USER, USER];
        sanitize_with(&mut frames, false);
        assert_eq!(frames, vec![BAD, USER]);
    }
}
