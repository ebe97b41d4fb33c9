//! Reader for the kernel's perf sample ring.
//!
//! The first page of the mapping holds the control block; the kernel
//! publishes `data_head`, the reader owns `data_tail`. Records are
//! `[perf_event_header][body]` and may wrap around the end of the data area.

use core::ptr::NonNull;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use protocol::event::{CallstackSample, ContextSwitch, FrameVsync, HwSample, ThreadWakeup};
use protocol::{Event, HwCounter, Payload};
use std::num::NonZero;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use super::attr::{self, PERF_RECORD_SAMPLE};
use crate::callstack::sanitize;
use crate::merge::TimestampedRing;
use crate::sched::{self, DrmVblank, SchedSwitch, SchedWakeup, SWITCH_REASON};
use crate::{EventSink, Result};

const DATA_HEAD_OFFSET: usize = 1024;
const DATA_TAIL_OFFSET: usize = 1032;
const HEADER_SIZE: u64 = 8;

/// Memory behind a ring: the data area plus the two cursors.
pub trait RingMemory {
    /// Power-of-two size of the data area.
    fn data_size(&self) -> usize;

    /// Copies `out.len()` bytes starting at `at`, which is already reduced
    /// modulo the data size and does not wrap.
    fn read(&self, at: usize, out: &mut [u8]);

    fn load_head(&self) -> u64;

    fn store_tail(&self, tail: u64);

    fn enable(&self) -> Result<()>;

    fn disable(&self) -> Result<()>;
}

/// A perf event fd and its shared mapping.
pub struct PerfMmap {
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
}

unsafe impl Send for PerfMmap {}

impl PerfMmap {
    pub fn new(fd: OwnedFd, data_size: usize) -> Result<Self> {
        let page_size = get_page_size();
        let len = data_size + page_size;
        let ptr = unsafe {
            mmap(
                None,
                NonZero::new(len).ok_or(nix::Error::EINVAL)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(PerfMmap {
            fd,
            base: ptr.cast(),
            len,
            page_size,
        })
    }

    fn control(&self, offset: usize) -> &AtomicU64 {
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }
}

impl RingMemory for PerfMmap {
    fn data_size(&self) -> usize {
        self.len - self.page_size
    }

    fn read(&self, at: usize, out: &mut [u8]) {
        unsafe {
            let src = self.base.as_ptr().add(self.page_size + at);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
    }

    fn load_head(&self) -> u64 {
        self.control(DATA_HEAD_OFFSET).load(Ordering::Acquire)
    }

    fn store_tail(&self, tail: u64) {
        self.control(DATA_TAIL_OFFSET).store(tail, Ordering::Release);
    }

    fn enable(&self) -> Result<()> {
        attr::enable(&self.fd)
    }

    fn disable(&self) -> Result<()> {
        attr::disable(&self.fd)
    }
}

impl Drop for PerfMmap {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

fn get_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// What a ring carries, which fixes its record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// `u32 pid, u32 tid, u64 time, u64 nr, u64 ips[nr]`
    Callstack,
    /// `u64 ip, u64 time`
    Hardware(HwCounter),
    /// `u64 time, u64 nr, u64 ips[nr], u32 size, u8 raw[size]`
    ContextSwitch,
    /// `u64 time, u32 size, u8 raw[size]`
    Wakeup,
    /// `u64 time, u32 size, u8 raw[size]`
    Vsync,
}

impl RingKind {
    fn time_offset(self) -> u64 {
        match self {
            RingKind::Callstack | RingKind::Hardware(_) => 8,
            RingKind::ContextSwitch | RingKind::Wakeup | RingKind::Vsync => 0,
        }
    }

    /// Whether rings of this kind need a cross-cpu merge.
    pub fn is_merged(self) -> bool {
        matches!(
            self,
            RingKind::ContextSwitch | RingKind::Wakeup | RingKind::Vsync
        )
    }
}

pub struct PerfRing<M> {
    memory: M,
    kind: RingKind,
    cpu: u32,
    tail: u64,
    end: u64,
    pos: u64,
}

impl<M: RingMemory> PerfRing<M> {
    pub fn new(memory: M, kind: RingKind, cpu: u32) -> Self {
        debug_assert!(memory.data_size().is_power_of_two());
        PerfRing {
            memory,
            kind,
            cpu,
            tail: 0,
            end: 0,
            pos: 0,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Header of the record at `offset`, `None` when it is corrupt.
    fn next_record(&self, offset: u64) -> Option<(u32, u64)> {
        let (type_, size) = self.read_header(offset);
        (size >= HEADER_SIZE).then_some((type_, size))
    }

    fn sample_time(&self, offset: u64) -> i64 {
        self.read_u64(offset + HEADER_SIZE + self.kind.time_offset()) as i64
    }

    /// Copies bytes at `offset` past the tail, following the wrap.
    fn read_into(&self, offset: u64, out: &mut [u8]) {
        let size = self.memory.data_size();
        let start = (self.tail.wrapping_add(offset) as usize) & (size - 1);
        let first = out.len().min(size - start);
        let (head, rest) = out.split_at_mut(first);
        self.memory.read(start, head);
        if !rest.is_empty() {
            self.memory.read(0, rest);
        }
    }

    fn read_u32(&self, offset: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_into(offset, &mut bytes);
        u32::from_ne_bytes(bytes)
    }

    fn read_u64(&self, offset: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_into(offset, &mut bytes);
        u64::from_ne_bytes(bytes)
    }

    /// `(type, size)` of the record at `offset`.
    fn read_header(&self, offset: u64) -> (u32, u64) {
        let mut bytes = [0u8; 8];
        self.read_into(offset, &mut bytes);
        let type_ = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let size = u16::from_ne_bytes([bytes[6], bytes[7]]);
        (type_, size as u64)
    }

    fn read_frames(&self, offset: u64, count: u64) -> Vec<u64> {
        (0..count).map(|i| self.read_u64(offset + i * 8)).collect()
    }

    fn read_raw(&self, offset: u64) -> Vec<u8> {
        let size = self.read_u32(offset) as usize;
        let mut raw = vec![0u8; size];
        self.read_into(offset + 4, &mut raw);
        raw
    }

    fn callstack_payload(&self, offset: u64, count: u64) -> Payload {
        let mut frames = self.read_frames(offset, count);
        sanitize(&mut frames);
        Payload::from_addresses(&frames)
    }

    fn decode(&self, sink: &mut dyn EventSink) {
        let body = self.pos + HEADER_SIZE;
        match self.kind {
            RingKind::Callstack => {
                let thread = self.read_u32(body + 4);
                let time = self.read_u64(body + 8) as i64;
                let count = self.read_u64(body + 16);
                if count > 0 {
                    sink.emit(Event::CallstackSample(CallstackSample {
                        time,
                        thread,
                        frames: self.callstack_payload(body + 24, count),
                    }));
                }
            }
            RingKind::Hardware(counter) => {
                let ip = self.read_u64(body);
                let time = self.read_u64(body + 8) as i64;
                sink.emit(Event::HwSample(HwSample { counter, time, ip }));
            }
            RingKind::ContextSwitch => {
                let time = self.read_u64(body) as i64;
                let count = self.read_u64(body + 8);
                let frames_at = body + 16;
                let raw = self.read_raw(frames_at + count * 8);
                let Some(switch) = sched::parse_raw::<SchedSwitch>(&raw) else {
                    return;
                };
                sink.emit(Event::ContextSwitch(ContextSwitch {
                    time,
                    old_thread: switch.prev_pid as u32,
                    new_thread: switch.next_pid as u32,
                    cpu: self.cpu as u8,
                    reason: SWITCH_REASON,
                    state: sched::thread_state(switch.prev_state),
                }));
                let prev = switch.prev_pid as u32;
                if count > 0 && prev != 0 && sched::owns_thread(prev) {
                    sink.emit(Event::CallstackSample(CallstackSample {
                        time,
                        thread: prev,
                        frames: self.callstack_payload(frames_at, count),
                    }));
                }
            }
            RingKind::Wakeup => {
                let time = self.read_u64(body) as i64;
                if let Some(wakeup) = sched::parse_raw::<SchedWakeup>(&self.read_raw(body + 8)) {
                    sink.emit(Event::ThreadWakeup(ThreadWakeup {
                        time,
                        thread: wakeup.pid as u32,
                    }));
                }
            }
            RingKind::Vsync => {
                let time = self.read_u64(body) as i64;
                if let Some(vblank) = sched::parse_raw::<DrmVblank>(&self.read_raw(body + 8)) {
                    sink.emit(Event::FrameVsync(FrameVsync {
                        time,
                        id: vblank.crtc as u32,
                    }));
                }
            }
        }
    }
}

impl<M: RingMemory> TimestampedRing for PerfRing<M> {
    fn begin_pass(&mut self) -> bool {
        self.end = self.memory.load_head().wrapping_sub(self.tail);
        self.pos = 0;
        self.end != 0
    }

    fn peek_time(&mut self) -> Option<i64> {
        while self.pos < self.end {
            let Some((type_, size)) = self.next_record(self.pos) else {
                // Corrupt header; give up on the rest of this pass.
                self.pos = self.end;
                return None;
            };
            if type_ == PERF_RECORD_SAMPLE {
                return Some(self.sample_time(self.pos));
            }
            self.pos += size;
        }
        None
    }

    fn last_time(&mut self) -> Option<i64> {
        let mut offset = self.pos;
        let mut last = None;
        while offset < self.end {
            let Some((type_, size)) = self.next_record(offset) else {
                break;
            };
            if type_ == PERF_RECORD_SAMPLE {
                last = Some(self.sample_time(offset));
            }
            offset += size;
        }
        last
    }

    fn pop(&mut self, sink: &mut dyn EventSink) {
        let (_, size) = self.read_header(self.pos);
        self.decode(sink);
        self.pos += size.max(HEADER_SIZE);
    }

    fn discard(&mut self) {
        let (_, size) = self.read_header(self.pos);
        self.pos += size.max(HEADER_SIZE);
    }

    fn end_pass(&mut self) {
        self.tail = self.tail.wrapping_add(self.pos.min(self.end));
        self.memory.store_tail(self.tail);
        self.end = 0;
        self.pos = 0;
    }
}
