//! Fatal signal reporting.
//!
//! [`install`] hooks the fatal signals. The first fault wins: it records a
//! crash report through the profiler, freezes every other application
//! thread, gives the transport a bounded window to flush the report, then
//! aborts. Faults racing it on other threads park forever.

use arc_swap::ArcSwapOption;
use libc::{c_int, c_void, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use protocol::Payload;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::producer::current_thread_id;
use crate::{AgentError, Profiler, Result};

const FATAL_SIGNALS: [Signal; 6] = [
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGPIPE,
    Signal::SIGBUS,
    Signal::SIGABRT,
];

/// Sent to every other thread so nothing runs while the report goes out.
const FREEZE_SIGNAL: Signal = Signal::SIGPWR;

const REPORT_GRACE: Duration = Duration::from_millis(500);

/// Platform hooks used while a crash is reported.
pub trait CrashHandler: Send + Sync {
    /// Call stack of the faulting thread, innermost frame first.
    fn capture_callstack(&self) -> Option<Payload> {
        None
    }

    /// Stops every thread of the process except those in `exempt`.
    fn freeze_peers(&self, exempt: &[i32]) {
        freeze_threads(exempt);
    }
}

/// Default handler: no call stack, peers frozen with a signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalFreezer;

impl CrashHandler for SignalFreezer {}

/// Lets exactly one caller through.
pub struct CrashGuard {
    claimed: AtomicBool,
}

impl CrashGuard {
    pub const fn new() -> Self {
        CrashGuard {
            claimed: AtomicBool::new(false),
        }
    }

    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for CrashGuard {
    fn default() -> Self {
        Self::new()
    }
}

struct CrashState {
    profiler: Profiler,
    handler: Box<dyn CrashHandler>,
}

static STATE: ArcSwapOption<CrashState> = ArcSwapOption::const_empty();
static INSTALLED: AtomicBool = AtomicBool::new(false);
static GUARD: CrashGuard = CrashGuard::new();

/// Installs the process-wide fatal signal handlers. Only one profiler can
/// own them.
pub fn install(profiler: &Profiler, handler: Box<dyn CrashHandler>) -> Result<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(AgentError::CrashHandlerInstalled);
    }
    STATE.store(Some(Arc::new(CrashState {
        profiler: profiler.clone(),
        handler,
    })));

    let fatal = SigAction::new(
        SigHandler::SigAction(on_fatal_signal),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    let freeze = SigAction::new(
        SigHandler::Handler(on_freeze_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        for signal in FATAL_SIGNALS {
            sigaction(signal, &fatal)?;
        }
        sigaction(FREEZE_SIGNAL, &freeze)?;
    }
    debug!("crash handler installed");
    Ok(())
}

fn restore_defaults() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in FATAL_SIGNALS {
        let _ = unsafe { sigaction(signal, &default) };
    }
}

extern "C" fn on_freeze_signal(_: c_int) {
    loop {
        unsafe {
            libc::pause();
        }
    }
}

extern "C" fn on_fatal_signal(signal: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    if !GUARD.claim() {
        // Another thread is already reporting and will end the process.
        on_freeze_signal(signal);
    }
    restore_defaults();
    let (code, addr) = if info.is_null() {
        (0, 0)
    } else {
        unsafe { ((*info).si_code, (*info).si_addr() as u64) }
    };
    if let Some(state) = STATE.load_full() {
        report(&state.profiler, state.handler.as_ref(), signal, code, addr);
        std::process::abort();
    }
    // Default disposition is back in place; re-raising terminates.
    unsafe {
        libc::raise(signal);
    }
}

/// Queues the report for a fatal signal, freezes every thread but the
/// caller and the profiler's workers, then requests shutdown and waits for
/// the final flush up to the configured shutdown timeout. Returns whether
/// the flush finished. The caller is expected to end the process.
pub fn report(
    profiler: &Profiler,
    handler: &dyn CrashHandler,
    signal: c_int,
    code: c_int,
    addr: u64,
) -> bool {
    let shared = profiler.shared();
    let text = describe(signal, code, addr);
    shared.submit_crash(text, handler.capture_callstack());

    let mut exempt = shared.worker_tids();
    exempt.push(current_thread_id() as i32);
    handler.freeze_peers(&exempt);

    thread::sleep(REPORT_GRACE);
    profiler.request_shutdown();
    let deadline = Instant::now() + shared.config.shutdown_timeout();
    while !profiler.has_shutdown_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    profiler.has_shutdown_finished()
}

fn task_ids() -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect()
}

/// Sends the freeze signal to every thread not in `exempt`.
pub fn freeze_threads(exempt: &[i32]) {
    let pid = std::process::id() as libc::pid_t;
    for tid in task_ids() {
        if exempt.contains(&tid) {
            continue;
        }
        unsafe {
            libc::syscall(libc::SYS_tgkill, pid, tid, FREEZE_SIGNAL as c_int);
        }
    }
}

fn sub_code(signal: c_int, code: c_int) -> Option<&'static str> {
    let message = match (signal, code) {
        (libc::SIGILL, 1) => "Illegal opcode.",
        (libc::SIGILL, 2) => "Illegal operand.",
        (libc::SIGILL, 3) => "Illegal addressing mode.",
        (libc::SIGILL, 4) => "Illegal trap.",
        (libc::SIGILL, 5) => "Privileged opcode.",
        (libc::SIGILL, 6) => "Privileged register.",
        (libc::SIGILL, 7) => "Coprocessor error.",
        (libc::SIGILL, 8) => "Internal stack error.",
        (libc::SIGFPE, 1) => "Integer divide by zero.",
        (libc::SIGFPE, 2) => "Integer overflow.",
        (libc::SIGFPE, 3) => "Floating-point divide by zero.",
        (libc::SIGFPE, 4) => "Floating-point overflow.",
        (libc::SIGFPE, 5) => "Floating-point underflow.",
        (libc::SIGFPE, 6) => "Floating-point inexact result.",
        (libc::SIGFPE, 7) => "Floating-point invalid operation.",
        (libc::SIGFPE, 8) => "Subscript out of range.",
        (libc::SIGSEGV, 1) => "Address not mapped to object.",
        (libc::SIGSEGV, 2) => "Invalid permissions for mapped object.",
        (libc::SIGSEGV, 3) => "Failed address bound checks.",
        (libc::SIGSEGV, 4) => "Access was denied by memory protection keys.",
        (libc::SIGBUS, 1) => "Invalid address alignment.",
        (libc::SIGBUS, 2) => "Nonexistent physical address.",
        (libc::SIGBUS, 3) => "Object-specific hardware error.",
        (libc::SIGBUS, 4) => {
            "Hardware memory error consumed on a machine check; action required."
        }
        (libc::SIGBUS, 5) => {
            "Hardware memory error detected in process but not consumed; action optional."
        }
        _ => return None,
    };
    Some(message)
}

/// Human readable cause of a fatal signal.
pub fn describe(signal: c_int, code: c_int, addr: u64) -> String {
    let headline = match signal {
        libc::SIGILL => "Illegal Instruction.",
        libc::SIGFPE => "Floating-point exception.",
        libc::SIGSEGV => "Invalid memory reference.",
        libc::SIGPIPE => "Broken pipe.",
        libc::SIGBUS => "Bus error.",
        libc::SIGABRT => "Abort signal from abort().",
        _ => "Unexpected signal.",
    };
    let mut text = headline.to_owned();
    if let Some(detail) = sub_code(signal, code) {
        text.push('\n');
        text.push_str(detail);
    }
    if signal != libc::SIGPIPE {
        text.push_str(&format!("\nFault address: 0x{addr:x}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case(libc::SIGSEGV, 1, 0x10, "Invalid memory reference.\nAddress not mapped to object.\nFault address: 0x10")]
    #[case(libc::SIGFPE, 1, 0x4000, "Floating-point exception.\nInteger divide by zero.\nFault address: 0x4000")]
    #[case(libc::SIGILL, 5, 0xdead, "Illegal Instruction.\nPrivileged opcode.\nFault address: 0xdead")]
    #[case(libc::SIGBUS, 1, 0x3, "Bus error.\nInvalid address alignment.\nFault address: 0x3")]
    #[case(libc::SIGABRT, 0, 0, "Abort signal from abort().\nFault address: 0x0")]
    #[case(libc::SIGPIPE, 0, 0x99, "Broken pipe.")]
    fn test_describe(
        #[case] signal: c_int,
        #[case] code: c_int,
        #[case] addr: u64,
        #[case] expected: &str,
    ) {
        assert_eq!(describe(signal, code, addr), expected);
    }

    #[rstest]
    fn test_unknown_sub_code_is_omitted() {
        assert_eq!(
            describe(libc::SIGSEGV, 99, 0x1),
            "Invalid memory reference.\nFault address: 0x1"
        );
    }

    #[rstest]
    fn test_guard_admits_one_claim() {
        let guard = Arc::new(CrashGuard::new());
        let winners: usize = (0..8)
            .map(|_| {
                let guard = guard.clone();
                thread::spawn(move || guard.claim())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(!guard.claim());
    }

    #[rstest]
    fn test_task_ids_include_current_thread() {
        let tid = current_thread_id() as i32;
        assert!(task_ids().contains(&tid));
    }
}
