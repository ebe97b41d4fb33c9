//! Event record model and its wire codec.
//!
//! A record is `[u8 kind][fixed payload][optional trailer]`. The fixed payload
//! size depends only on the kind (see [`EventKind::fixed_size`]); the trailer
//! is a little-endian length (u16 for short strings, u32 for long blobs)
//! followed by that many bytes. Timestamp fields of a categorised kind travel
//! as signed deltas against [`RefClocks`].

use bytes::{Buf, BufMut, BytesMut};

use crate::clock::{RefClocks, TimeCategory};
use crate::{Payload, ProtocolError, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum EventKind {
    ZoneBegin = 0,
    ZoneBeginCallstack,
    ZoneEnd,
    ZoneText,
    ZoneName,
    ZoneColor,
    ZoneValue,
    FrameMark,
    Message,
    MessageAppInfo,
    MemAlloc,
    MemFree,
    Callstack,
    LockAnnounce,
    LockTerminate,
    LockWait,
    LockObtain,
    LockRelease,
    LockName,
    GpuNewContext,
    GpuZoneBegin,
    GpuZoneEnd,
    GpuTime,
    GpuContextName,
    PlotData,
    FiberEnter,
    FiberLeave,
    ContextSwitch,
    ThreadWakeup,
    FrameVsync,
    CallstackSample,
    HwSample,
    ThreadContext,
    KeepAlive,
    Terminate,
    Crash,
    CrashReport,
    StringData,
    ThreadName,
    SourceLocation,
    CallstackFrame,
    SymbolInformation,
    SymbolCode,
    SourceCode,
    ParameterSetup,
    OnDemandPayload,
    AckServerQueryNoop,
    AckSourceCodeNotAvailable,
    AckSymbolCodeNotAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailerKind {
    None,
    /// u16 length prefix.
    Short,
    /// u32 length prefix.
    Long,
}

impl EventKind {
    pub const COUNT: usize = EventKind::AckSymbolCodeNotAvailable as usize + 1;

    pub const ALL: [EventKind; EventKind::COUNT] = [
        EventKind::ZoneBegin,
        EventKind::ZoneBeginCallstack,
        EventKind::ZoneEnd,
        EventKind::ZoneText,
        EventKind::ZoneName,
        EventKind::ZoneColor,
        EventKind::ZoneValue,
        EventKind::FrameMark,
        EventKind::Message,
        EventKind::MessageAppInfo,
        EventKind::MemAlloc,
        EventKind::MemFree,
        EventKind::Callstack,
        EventKind::LockAnnounce,
        EventKind::LockTerminate,
        EventKind::LockWait,
        EventKind::LockObtain,
        EventKind::LockRelease,
        EventKind::LockName,
        EventKind::GpuNewContext,
        EventKind::GpuZoneBegin,
        EventKind::GpuZoneEnd,
        EventKind::GpuTime,
        EventKind::GpuContextName,
        EventKind::PlotData,
        EventKind::FiberEnter,
        EventKind::FiberLeave,
        EventKind::ContextSwitch,
        EventKind::ThreadWakeup,
        EventKind::FrameVsync,
        EventKind::CallstackSample,
        EventKind::HwSample,
        EventKind::ThreadContext,
        EventKind::KeepAlive,
        EventKind::Terminate,
        EventKind::Crash,
        EventKind::CrashReport,
        EventKind::StringData,
        EventKind::ThreadName,
        EventKind::SourceLocation,
        EventKind::CallstackFrame,
        EventKind::SymbolInformation,
        EventKind::SymbolCode,
        EventKind::SourceCode,
        EventKind::ParameterSetup,
        EventKind::OnDemandPayload,
        EventKind::AckServerQueryNoop,
        EventKind::AckSourceCodeNotAvailable,
        EventKind::AckSymbolCodeNotAvailable,
    ];

    /// Size in bytes of the fixed payload following the kind byte.
    pub const fn fixed_size(self) -> usize {
        match self {
            EventKind::ZoneBegin | EventKind::ZoneBeginCallstack => 8 + 8,
            EventKind::ZoneEnd => 8,
            EventKind::ZoneText | EventKind::ZoneName => 0,
            EventKind::ZoneColor => 4,
            EventKind::ZoneValue => 8,
            EventKind::FrameMark => 8 + 8,
            EventKind::Message => 8 + 4,
            EventKind::MessageAppInfo => 8,
            EventKind::MemAlloc => 8 + 4 + 8 + 8,
            EventKind::MemFree => 8 + 4 + 8,
            EventKind::Callstack => 0,
            EventKind::LockAnnounce => 4 + 8 + 8 + 1,
            EventKind::LockTerminate => 4 + 8,
            EventKind::LockWait | EventKind::LockObtain | EventKind::LockRelease => 4 + 4 + 8,
            EventKind::LockName => 4,
            EventKind::GpuNewContext => 8 + 8 + 4 + 4 + 1 + 1 + 1,
            EventKind::GpuZoneBegin => 8 + 8 + 4 + 2 + 1,
            EventKind::GpuZoneEnd => 8 + 4 + 2 + 1,
            EventKind::GpuTime => 8 + 2 + 1,
            EventKind::GpuContextName => 1,
            EventKind::PlotData => 8 + 8 + 8,
            EventKind::FiberEnter => 8 + 8 + 4,
            EventKind::FiberLeave => 8 + 4,
            EventKind::ContextSwitch => 8 + 4 + 4 + 1 + 1 + 1,
            EventKind::ThreadWakeup => 8 + 4,
            EventKind::FrameVsync => 8 + 4,
            EventKind::CallstackSample => 8 + 4,
            EventKind::HwSample => 1 + 8 + 8,
            EventKind::ThreadContext => 4,
            EventKind::KeepAlive | EventKind::Terminate | EventKind::Crash => 0,
            EventKind::CrashReport => 8,
            EventKind::StringData => 8,
            EventKind::ThreadName => 8,
            EventKind::SourceLocation => 8 + 8 + 8 + 8 + 4 + 4,
            EventKind::CallstackFrame => 8,
            EventKind::SymbolInformation => 8 + 4,
            EventKind::SymbolCode => 8,
            EventKind::SourceCode => 4,
            EventKind::ParameterSetup => 4 + 8 + 1 + 4,
            EventKind::OnDemandPayload => 8 + 8,
            EventKind::AckServerQueryNoop => 0,
            EventKind::AckSourceCodeNotAvailable => 4,
            EventKind::AckSymbolCodeNotAvailable => 8,
        }
    }

    pub const fn trailer(self) -> TrailerKind {
        match self {
            EventKind::ZoneText
            | EventKind::ZoneName
            | EventKind::Message
            | EventKind::MessageAppInfo
            | EventKind::LockName
            | EventKind::GpuContextName
            | EventKind::CrashReport
            | EventKind::StringData
            | EventKind::ThreadName
            | EventKind::SymbolInformation => TrailerKind::Short,
            EventKind::Callstack
            | EventKind::CallstackSample
            | EventKind::CallstackFrame
            | EventKind::SymbolCode
            | EventKind::SourceCode => TrailerKind::Long,
            _ => TrailerKind::None,
        }
    }

    /// Category of the kind's delta-encoded timestamp, if it has one.
    pub const fn time_category(self) -> Option<TimeCategory> {
        match self {
            EventKind::ZoneBegin
            | EventKind::ZoneBeginCallstack
            | EventKind::ZoneEnd
            | EventKind::PlotData => Some(TimeCategory::Thread),
            EventKind::ContextSwitch | EventKind::ThreadWakeup | EventKind::FrameVsync => {
                Some(TimeCategory::Context)
            }
            EventKind::GpuTime => Some(TimeCategory::Gpu),
            EventKind::MemAlloc
            | EventKind::MemFree
            | EventKind::LockWait
            | EventKind::LockObtain
            | EventKind::LockRelease
            | EventKind::GpuZoneBegin
            | EventKind::GpuZoneEnd
            | EventKind::FiberEnter
            | EventKind::FiberLeave => Some(TimeCategory::Serial),
            _ => None,
        }
    }

    /// Kinds whose cross-thread order must be preserved and therefore go
    /// through the serial queue.
    pub const fn is_serial(self) -> bool {
        matches!(self.time_category(), Some(TimeCategory::Serial))
            || matches!(self, EventKind::GpuNewContext)
    }

    /// Metadata retained for replay to every new peer in on-demand mode.
    pub const fn is_sticky(self) -> bool {
        matches!(
            self,
            EventKind::MessageAppInfo
                | EventKind::LockName
                | EventKind::GpuContextName
                | EventKind::ParameterSetup
        )
    }

    pub fn from_u8(value: u8) -> Option<EventKind> {
        EventKind::ALL.get(value as usize).copied()
    }
}

/// Fixed payload size per kind, indexed by the kind byte.
pub static FIXED_SIZES: [usize; EventKind::COUNT] = fixed_sizes();

const fn fixed_sizes() -> [usize; EventKind::COUNT] {
    let mut table = [0usize; EventKind::COUNT];
    let mut i = 0;
    while i < EventKind::COUNT {
        assert!(EventKind::ALL[i] as usize == i, "event kinds must be dense");
        table[i] = EventKind::ALL[i].fixed_size();
        i += 1;
    }
    table
}

const _: () = assert!(EventKind::COUNT <= u8::MAX as usize);
const _: () = assert!(EventKind::GpuNewContext.fixed_size() == 27);
const _: () = assert!(EventKind::SourceLocation.fixed_size() == 40);

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ZoneBegin {
    pub time: i64,
    pub srcloc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ZoneEnd {
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ZoneText {
    pub text: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ZoneColor {
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ZoneValue {
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FrameMark {
    pub time: i64,
    /// Interned name; zero for the default frame set.
    pub name: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Message {
    pub time: i64,
    pub color: u32,
    pub text: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AppInfo {
    pub time: i64,
    pub text: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MemAlloc {
    pub time: i64,
    pub thread: u32,
    pub ptr: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MemFree {
    pub time: i64,
    pub thread: u32,
    pub ptr: u64,
}

/// Call stack attached to the record that follows it on the same thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Callstack {
    pub frames: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockAnnounce {
    pub id: u32,
    pub time: i64,
    pub srcloc: u64,
    pub lock_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockTerminate {
    pub id: u32,
    pub time: i64,
}

/// Shared by wait, obtain and release.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockEvent {
    pub thread: u32,
    pub id: u32,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LockName {
    pub id: u32,
    pub name: Payload,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GpuNewContext {
    pub cpu_time: i64,
    pub gpu_time: i64,
    pub thread: u32,
    pub period: f32,
    pub context: u8,
    pub flags: u8,
    pub gpu_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GpuZoneBegin {
    pub cpu_time: i64,
    pub srcloc: u64,
    pub thread: u32,
    pub query_id: u16,
    pub context: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GpuZoneEnd {
    pub cpu_time: i64,
    pub thread: u32,
    pub query_id: u16,
    pub context: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GpuTime {
    pub gpu_time: i64,
    pub query_id: u16,
    pub context: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GpuContextName {
    pub context: u8,
    pub name: Payload,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PlotData {
    pub name: u64,
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FiberEnter {
    pub time: i64,
    pub fiber: u64,
    pub thread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FiberLeave {
    pub time: i64,
    pub thread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ContextSwitch {
    pub time: i64,
    pub old_thread: u32,
    pub new_thread: u32,
    pub cpu: u8,
    pub reason: u8,
    pub state: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThreadWakeup {
    pub time: i64,
    pub thread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FrameVsync {
    pub time: i64,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CallstackSample {
    pub time: i64,
    pub thread: u32,
    pub frames: Payload,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum HwCounter {
    CpuCycles = 0,
    Instructions,
    CacheReference,
    CacheMiss,
    BranchRetired,
    BranchMiss,
}

impl HwCounter {
    pub fn from_u8(value: u8) -> Option<HwCounter> {
        match value {
            0 => Some(HwCounter::CpuCycles),
            1 => Some(HwCounter::Instructions),
            2 => Some(HwCounter::CacheReference),
            3 => Some(HwCounter::CacheMiss),
            4 => Some(HwCounter::BranchRetired),
            5 => Some(HwCounter::BranchMiss),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HwSample {
    pub counter: HwCounter,
    pub time: i64,
    pub ip: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThreadContext {
    pub thread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CrashReport {
    pub time: i64,
    pub text: Payload,
}

/// Answer to a string or plot-name query.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StringData {
    pub ptr: u64,
    pub text: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThreadName {
    pub thread: u64,
    pub name: Payload,
}

/// Source location; the three name fields are interned string ids the
/// peer resolves with string queries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SourceLocation {
    pub ptr: u64,
    pub name: u64,
    pub function: u64,
    pub file: u64,
    pub line: u32,
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CallstackFrame {
    pub ptr: u64,
    /// Opaque symbolizer output.
    pub frames: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SymbolInformation {
    pub addr: u64,
    pub line: u32,
    pub file: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SymbolCode {
    pub addr: u64,
    pub code: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SourceCode {
    pub id: u32,
    pub text: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ParameterSetup {
    pub idx: u32,
    pub name: u64,
    pub is_bool: bool,
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OnDemandPayload {
    pub frames: u64,
    pub current_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum Event {
    ZoneBegin(ZoneBegin),
    ZoneBeginCallstack(ZoneBegin),
    ZoneEnd(ZoneEnd),
    ZoneText(ZoneText),
    ZoneName(ZoneText),
    ZoneColor(ZoneColor),
    ZoneValue(ZoneValue),
    FrameMark(FrameMark),
    Message(Message),
    MessageAppInfo(AppInfo),
    MemAlloc(MemAlloc),
    MemFree(MemFree),
    Callstack(Callstack),
    LockAnnounce(LockAnnounce),
    LockTerminate(LockTerminate),
    LockWait(LockEvent),
    LockObtain(LockEvent),
    LockRelease(LockEvent),
    LockName(LockName),
    GpuNewContext(GpuNewContext),
    GpuZoneBegin(GpuZoneBegin),
    GpuZoneEnd(GpuZoneEnd),
    GpuTime(GpuTime),
    GpuContextName(GpuContextName),
    PlotData(PlotData),
    FiberEnter(FiberEnter),
    FiberLeave(FiberLeave),
    ContextSwitch(ContextSwitch),
    ThreadWakeup(ThreadWakeup),
    FrameVsync(FrameVsync),
    CallstackSample(CallstackSample),
    HwSample(HwSample),
    ThreadContext(ThreadContext),
    KeepAlive,
    Terminate,
    Crash,
    CrashReport(CrashReport),
    StringData(StringData),
    ThreadName(ThreadName),
    SourceLocation(SourceLocation),
    CallstackFrame(CallstackFrame),
    SymbolInformation(SymbolInformation),
    SymbolCode(SymbolCode),
    SourceCode(SourceCode),
    ParameterSetup(ParameterSetup),
    OnDemandPayload(OnDemandPayload),
    AckServerQueryNoop,
    AckSourceCodeNotAvailable { id: u32 },
    AckSymbolCodeNotAvailable { addr: u64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ZoneBegin(_) => EventKind::ZoneBegin,
            Event::ZoneBeginCallstack(_) => EventKind::ZoneBeginCallstack,
            Event::ZoneEnd(_) => EventKind::ZoneEnd,
            Event::ZoneText(_) => EventKind::ZoneText,
            Event::ZoneName(_) => EventKind::ZoneName,
            Event::ZoneColor(_) => EventKind::ZoneColor,
            Event::ZoneValue(_) => EventKind::ZoneValue,
            Event::FrameMark(_) => EventKind::FrameMark,
            Event::Message(_) => EventKind::Message,
            Event::MessageAppInfo(_) => EventKind::MessageAppInfo,
            Event::MemAlloc(_) => EventKind::MemAlloc,
            Event::MemFree(_) => EventKind::MemFree,
            Event::Callstack(_) => EventKind::Callstack,
            Event::LockAnnounce(_) => EventKind::LockAnnounce,
            Event::LockTerminate(_) => EventKind::LockTerminate,
            Event::LockWait(_) => EventKind::LockWait,
            Event::LockObtain(_) => EventKind::LockObtain,
            Event::LockRelease(_) => EventKind::LockRelease,
            Event::LockName(_) => EventKind::LockName,
            Event::GpuNewContext(_) => EventKind::GpuNewContext,
            Event::GpuZoneBegin(_) => EventKind::GpuZoneBegin,
            Event::GpuZoneEnd(_) => EventKind::GpuZoneEnd,
            Event::GpuTime(_) => EventKind::GpuTime,
            Event::GpuContextName(_) => EventKind::GpuContextName,
            Event::PlotData(_) => EventKind::PlotData,
            Event::FiberEnter(_) => EventKind::FiberEnter,
            Event::FiberLeave(_) => EventKind::FiberLeave,
            Event::ContextSwitch(_) => EventKind::ContextSwitch,
            Event::ThreadWakeup(_) => EventKind::ThreadWakeup,
            Event::FrameVsync(_) => EventKind::FrameVsync,
            Event::CallstackSample(_) => EventKind::CallstackSample,
            Event::HwSample(_) => EventKind::HwSample,
            Event::ThreadContext(_) => EventKind::ThreadContext,
            Event::KeepAlive => EventKind::KeepAlive,
            Event::Terminate => EventKind::Terminate,
            Event::Crash => EventKind::Crash,
            Event::CrashReport(_) => EventKind::CrashReport,
            Event::StringData(_) => EventKind::StringData,
            Event::ThreadName(_) => EventKind::ThreadName,
            Event::SourceLocation(_) => EventKind::SourceLocation,
            Event::CallstackFrame(_) => EventKind::CallstackFrame,
            Event::SymbolInformation(_) => EventKind::SymbolInformation,
            Event::SymbolCode(_) => EventKind::SymbolCode,
            Event::SourceCode(_) => EventKind::SourceCode,
            Event::ParameterSetup(_) => EventKind::ParameterSetup,
            Event::OnDemandPayload(_) => EventKind::OnDemandPayload,
            Event::AckServerQueryNoop => EventKind::AckServerQueryNoop,
            Event::AckSourceCodeNotAvailable { .. } => EventKind::AckSourceCodeNotAvailable,
            Event::AckSymbolCodeNotAvailable { .. } => EventKind::AckSymbolCodeNotAvailable,
        }
    }

    /// Variable-length trailer carried by this record, if any.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Event::ZoneText(e) | Event::ZoneName(e) => Some(&e.text),
            Event::Message(e) => Some(&e.text),
            Event::MessageAppInfo(e) => Some(&e.text),
            Event::Callstack(e) => Some(&e.frames),
            Event::LockName(e) => Some(&e.name),
            Event::GpuContextName(e) => Some(&e.name),
            Event::CallstackSample(e) => Some(&e.frames),
            Event::CrashReport(e) => Some(&e.text),
            Event::StringData(e) => Some(&e.text),
            Event::ThreadName(e) => Some(&e.name),
            Event::CallstackFrame(e) => Some(&e.frames),
            Event::SymbolInformation(e) => Some(&e.file),
            Event::SymbolCode(e) => Some(&e.code),
            Event::SourceCode(e) => Some(&e.text),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let kind = self.kind();
        let trailer = match (kind.trailer(), self.payload()) {
            (TrailerKind::Short, Some(p)) => 2 + p.len(),
            (TrailerKind::Long, Some(p)) => 4 + p.len(),
            _ => 0,
        };
        1 + kind.fixed_size() + trailer
    }

    /// Appends the record to `buf`, turning categorised timestamps into
    /// deltas against `clocks`.
    pub fn encode(&self, clocks: &mut RefClocks, buf: &mut BytesMut) -> Result<()> {
        let kind = self.kind();
        if let (TrailerKind::Short, Some(p)) = (kind.trailer(), self.payload()) {
            if p.len() > u16::MAX as usize {
                return Err(ProtocolError::TrailerTooLong { kind, len: p.len() });
            }
        }
        if let (TrailerKind::Long, Some(p)) = (kind.trailer(), self.payload()) {
            if p.len() > u32::MAX as usize {
                return Err(ProtocolError::TrailerTooLong { kind, len: p.len() });
            }
        }

        buf.reserve(self.encoded_len());
        buf.put_u8(kind as u8);
        let start = buf.len();

        match self {
            Event::ZoneBegin(e) | Event::ZoneBeginCallstack(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Thread, e.time));
                buf.put_u64_le(e.srcloc);
            }
            Event::ZoneEnd(e) => buf.put_i64_le(clocks.encode(TimeCategory::Thread, e.time)),
            Event::ZoneText(_) | Event::ZoneName(_) | Event::Callstack(_) => {}
            Event::ZoneColor(e) => buf.put_u32_le(e.color),
            Event::ZoneValue(e) => buf.put_u64_le(e.value),
            Event::FrameMark(e) => {
                buf.put_i64_le(e.time);
                buf.put_u64_le(e.name);
            }
            Event::Message(e) => {
                buf.put_i64_le(e.time);
                buf.put_u32_le(e.color);
            }
            Event::MessageAppInfo(e) => buf.put_i64_le(e.time),
            Event::MemAlloc(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.time));
                buf.put_u32_le(e.thread);
                buf.put_u64_le(e.ptr);
                buf.put_u64_le(e.size);
            }
            Event::MemFree(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.time));
                buf.put_u32_le(e.thread);
                buf.put_u64_le(e.ptr);
            }
            Event::LockAnnounce(e) => {
                buf.put_u32_le(e.id);
                buf.put_i64_le(e.time);
                buf.put_u64_le(e.srcloc);
                buf.put_u8(e.lock_type);
            }
            Event::LockTerminate(e) => {
                buf.put_u32_le(e.id);
                buf.put_i64_le(e.time);
            }
            Event::LockWait(e) | Event::LockObtain(e) | Event::LockRelease(e) => {
                buf.put_u32_le(e.thread);
                buf.put_u32_le(e.id);
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.time));
            }
            Event::LockName(e) => buf.put_u32_le(e.id),
            Event::GpuNewContext(e) => {
                buf.put_i64_le(e.cpu_time);
                buf.put_i64_le(e.gpu_time);
                buf.put_u32_le(e.thread);
                buf.put_f32_le(e.period);
                buf.put_u8(e.context);
                buf.put_u8(e.flags);
                buf.put_u8(e.gpu_type);
            }
            Event::GpuZoneBegin(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.cpu_time));
                buf.put_u64_le(e.srcloc);
                buf.put_u32_le(e.thread);
                buf.put_u16_le(e.query_id);
                buf.put_u8(e.context);
            }
            Event::GpuZoneEnd(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.cpu_time));
                buf.put_u32_le(e.thread);
                buf.put_u16_le(e.query_id);
                buf.put_u8(e.context);
            }
            Event::GpuTime(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Gpu, e.gpu_time));
                buf.put_u16_le(e.query_id);
                buf.put_u8(e.context);
            }
            Event::GpuContextName(e) => buf.put_u8(e.context),
            Event::PlotData(e) => {
                buf.put_u64_le(e.name);
                buf.put_i64_le(clocks.encode(TimeCategory::Thread, e.time));
                buf.put_f64_le(e.value);
            }
            Event::FiberEnter(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.time));
                buf.put_u64_le(e.fiber);
                buf.put_u32_le(e.thread);
            }
            Event::FiberLeave(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Serial, e.time));
                buf.put_u32_le(e.thread);
            }
            Event::ContextSwitch(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Context, e.time));
                buf.put_u32_le(e.old_thread);
                buf.put_u32_le(e.new_thread);
                buf.put_u8(e.cpu);
                buf.put_u8(e.reason);
                buf.put_u8(e.state);
            }
            Event::ThreadWakeup(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Context, e.time));
                buf.put_u32_le(e.thread);
            }
            Event::FrameVsync(e) => {
                buf.put_i64_le(clocks.encode(TimeCategory::Context, e.time));
                buf.put_u32_le(e.id);
            }
            Event::CallstackSample(e) => {
                buf.put_i64_le(e.time);
                buf.put_u32_le(e.thread);
            }
            Event::HwSample(e) => {
                buf.put_u8(e.counter as u8);
                buf.put_i64_le(e.time);
                buf.put_u64_le(e.ip);
            }
            Event::ThreadContext(e) => {
                buf.put_u32_le(e.thread);
                clocks.reset_thread();
            }
            Event::KeepAlive | Event::Terminate | Event::Crash | Event::AckServerQueryNoop => {}
            Event::CrashReport(e) => buf.put_i64_le(e.time),
            Event::StringData(e) => buf.put_u64_le(e.ptr),
            Event::ThreadName(e) => buf.put_u64_le(e.thread),
            Event::SourceLocation(e) => {
                buf.put_u64_le(e.ptr);
                buf.put_u64_le(e.name);
                buf.put_u64_le(e.function);
                buf.put_u64_le(e.file);
                buf.put_u32_le(e.line);
                buf.put_u32_le(e.color);
            }
            Event::CallstackFrame(e) => buf.put_u64_le(e.ptr),
            Event::SymbolInformation(e) => {
                buf.put_u64_le(e.addr);
                buf.put_u32_le(e.line);
            }
            Event::SymbolCode(e) => buf.put_u64_le(e.addr),
            Event::SourceCode(e) => buf.put_u32_le(e.id),
            Event::ParameterSetup(e) => {
                buf.put_u32_le(e.idx);
                buf.put_u64_le(e.name);
                buf.put_u8(e.is_bool as u8);
                buf.put_i32_le(e.value);
            }
            Event::OnDemandPayload(e) => {
                buf.put_u64_le(e.frames);
                buf.put_i64_le(e.current_time);
            }
            Event::AckSourceCodeNotAvailable { id } => buf.put_u32_le(*id),
            Event::AckSymbolCodeNotAvailable { addr } => buf.put_u64_le(*addr),
        }

        debug_assert_eq!(
            buf.len() - start,
            FIXED_SIZES[kind as usize],
            "fixed payload of {:?} does not match the size table",
            kind
        );

        match (kind.trailer(), self.payload()) {
            (TrailerKind::Short, Some(p)) => {
                buf.put_u16_le(p.len() as u16);
                buf.put_slice(p.as_bytes());
            }
            (TrailerKind::Long, Some(p)) => {
                buf.put_u32_le(p.len() as u32);
                buf.put_slice(p.as_bytes());
            }
            _ => {}
        }
        Ok(())
    }

    /// Reads one record from `buf`, rebuilding absolute timestamps.
    pub fn decode(clocks: &mut RefClocks, buf: &mut impl Buf) -> Result<Event> {
        if !buf.has_remaining() {
            return Err(ProtocolError::Truncated {
                needed: 1,
                available: 0,
            });
        }
        let raw = buf.get_u8();
        let kind = EventKind::from_u8(raw).ok_or(ProtocolError::UnknownKind(raw))?;
        need(buf.remaining(), kind.fixed_size())?;

        let event = match kind {
            EventKind::ZoneBegin | EventKind::ZoneBeginCallstack => {
                let time = clocks.decode(TimeCategory::Thread, buf.get_i64_le());
                let zone = ZoneBegin {
                    time,
                    srcloc: buf.get_u64_le(),
                };
                if kind == EventKind::ZoneBegin {
                    Event::ZoneBegin(zone)
                } else {
                    Event::ZoneBeginCallstack(zone)
                }
            }
            EventKind::ZoneEnd => Event::ZoneEnd(ZoneEnd {
                time: clocks.decode(TimeCategory::Thread, buf.get_i64_le()),
            }),
            EventKind::ZoneText => Event::ZoneText(ZoneText {
                text: get_short(buf)?,
            }),
            EventKind::ZoneName => Event::ZoneName(ZoneText {
                text: get_short(buf)?,
            }),
            EventKind::ZoneColor => Event::ZoneColor(ZoneColor {
                color: buf.get_u32_le(),
            }),
            EventKind::ZoneValue => Event::ZoneValue(ZoneValue {
                value: buf.get_u64_le(),
            }),
            EventKind::FrameMark => Event::FrameMark(FrameMark {
                time: buf.get_i64_le(),
                name: buf.get_u64_le(),
            }),
            EventKind::Message => {
                let time = buf.get_i64_le();
                let color = buf.get_u32_le();
                Event::Message(Message {
                    time,
                    color,
                    text: get_short(buf)?,
                })
            }
            EventKind::MessageAppInfo => {
                let time = buf.get_i64_le();
                Event::MessageAppInfo(AppInfo {
                    time,
                    text: get_short(buf)?,
                })
            }
            EventKind::MemAlloc => Event::MemAlloc(MemAlloc {
                time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                thread: buf.get_u32_le(),
                ptr: buf.get_u64_le(),
                size: buf.get_u64_le(),
            }),
            EventKind::MemFree => Event::MemFree(MemFree {
                time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                thread: buf.get_u32_le(),
                ptr: buf.get_u64_le(),
            }),
            EventKind::Callstack => Event::Callstack(Callstack {
                frames: get_long(buf)?,
            }),
            EventKind::LockAnnounce => Event::LockAnnounce(LockAnnounce {
                id: buf.get_u32_le(),
                time: buf.get_i64_le(),
                srcloc: buf.get_u64_le(),
                lock_type: buf.get_u8(),
            }),
            EventKind::LockTerminate => Event::LockTerminate(LockTerminate {
                id: buf.get_u32_le(),
                time: buf.get_i64_le(),
            }),
            EventKind::LockWait | EventKind::LockObtain | EventKind::LockRelease => {
                let lock = LockEvent {
                    thread: buf.get_u32_le(),
                    id: buf.get_u32_le(),
                    time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                };
                match kind {
                    EventKind::LockWait => Event::LockWait(lock),
                    EventKind::LockObtain => Event::LockObtain(lock),
                    _ => Event::LockRelease(lock),
                }
            }
            EventKind::LockName => {
                let id = buf.get_u32_le();
                Event::LockName(LockName {
                    id,
                    name: get_short(buf)?,
                })
            }
            EventKind::GpuNewContext => Event::GpuNewContext(GpuNewContext {
                cpu_time: buf.get_i64_le(),
                gpu_time: buf.get_i64_le(),
                thread: buf.get_u32_le(),
                period: buf.get_f32_le(),
                context: buf.get_u8(),
                flags: buf.get_u8(),
                gpu_type: buf.get_u8(),
            }),
            EventKind::GpuZoneBegin => Event::GpuZoneBegin(GpuZoneBegin {
                cpu_time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                srcloc: buf.get_u64_le(),
                thread: buf.get_u32_le(),
                query_id: buf.get_u16_le(),
                context: buf.get_u8(),
            }),
            EventKind::GpuZoneEnd => Event::GpuZoneEnd(GpuZoneEnd {
                cpu_time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                thread: buf.get_u32_le(),
                query_id: buf.get_u16_le(),
                context: buf.get_u8(),
            }),
            EventKind::GpuTime => Event::GpuTime(GpuTime {
                gpu_time: clocks.decode(TimeCategory::Gpu, buf.get_i64_le()),
                query_id: buf.get_u16_le(),
                context: buf.get_u8(),
            }),
            EventKind::GpuContextName => {
                let context = buf.get_u8();
                Event::GpuContextName(GpuContextName {
                    context,
                    name: get_short(buf)?,
                })
            }
            EventKind::PlotData => Event::PlotData(PlotData {
                name: buf.get_u64_le(),
                time: clocks.decode(TimeCategory::Thread, buf.get_i64_le()),
                value: buf.get_f64_le(),
            }),
            EventKind::FiberEnter => Event::FiberEnter(FiberEnter {
                time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                fiber: buf.get_u64_le(),
                thread: buf.get_u32_le(),
            }),
            EventKind::FiberLeave => Event::FiberLeave(FiberLeave {
                time: clocks.decode(TimeCategory::Serial, buf.get_i64_le()),
                thread: buf.get_u32_le(),
            }),
            EventKind::ContextSwitch => Event::ContextSwitch(ContextSwitch {
                time: clocks.decode(TimeCategory::Context, buf.get_i64_le()),
                old_thread: buf.get_u32_le(),
                new_thread: buf.get_u32_le(),
                cpu: buf.get_u8(),
                reason: buf.get_u8(),
                state: buf.get_u8(),
            }),
            EventKind::ThreadWakeup => Event::ThreadWakeup(ThreadWakeup {
                time: clocks.decode(TimeCategory::Context, buf.get_i64_le()),
                thread: buf.get_u32_le(),
            }),
            EventKind::FrameVsync => Event::FrameVsync(FrameVsync {
                time: clocks.decode(TimeCategory::Context, buf.get_i64_le()),
                id: buf.get_u32_le(),
            }),
            EventKind::CallstackSample => {
                let time = buf.get_i64_le();
                let thread = buf.get_u32_le();
                Event::CallstackSample(CallstackSample {
                    time,
                    thread,
                    frames: get_long(buf)?,
                })
            }
            EventKind::HwSample => {
                let raw_counter = buf.get_u8();
                let counter = HwCounter::from_u8(raw_counter)
                    .ok_or(ProtocolError::InvalidField { kind, value: raw_counter as u64 })?;
                Event::HwSample(HwSample {
                    counter,
                    time: buf.get_i64_le(),
                    ip: buf.get_u64_le(),
                })
            }
            EventKind::ThreadContext => {
                let thread = buf.get_u32_le();
                clocks.reset_thread();
                Event::ThreadContext(ThreadContext { thread })
            }
            EventKind::KeepAlive => Event::KeepAlive,
            EventKind::Terminate => Event::Terminate,
            EventKind::Crash => Event::Crash,
            EventKind::CrashReport => {
                let time = buf.get_i64_le();
                Event::CrashReport(CrashReport {
                    time,
                    text: get_short(buf)?,
                })
            }
            EventKind::StringData => {
                let ptr = buf.get_u64_le();
                Event::StringData(StringData {
                    ptr,
                    text: get_short(buf)?,
                })
            }
            EventKind::ThreadName => {
                let thread = buf.get_u64_le();
                Event::ThreadName(ThreadName {
                    thread,
                    name: get_short(buf)?,
                })
            }
            EventKind::SourceLocation => Event::SourceLocation(SourceLocation {
                ptr: buf.get_u64_le(),
                name: buf.get_u64_le(),
                function: buf.get_u64_le(),
                file: buf.get_u64_le(),
                line: buf.get_u32_le(),
                color: buf.get_u32_le(),
            }),
            EventKind::CallstackFrame => {
                let ptr = buf.get_u64_le();
                Event::CallstackFrame(CallstackFrame {
                    ptr,
                    frames: get_long(buf)?,
                })
            }
            EventKind::SymbolInformation => {
                let addr = buf.get_u64_le();
                let line = buf.get_u32_le();
                Event::SymbolInformation(SymbolInformation {
                    addr,
                    line,
                    file: get_short(buf)?,
                })
            }
            EventKind::SymbolCode => {
                let addr = buf.get_u64_le();
                Event::SymbolCode(SymbolCode {
                    addr,
                    code: get_long(buf)?,
                })
            }
            EventKind::SourceCode => {
                let id = buf.get_u32_le();
                Event::SourceCode(SourceCode {
                    id,
                    text: get_long(buf)?,
                })
            }
            EventKind::ParameterSetup => Event::ParameterSetup(ParameterSetup {
                idx: buf.get_u32_le(),
                name: buf.get_u64_le(),
                is_bool: buf.get_u8() != 0,
                value: buf.get_i32_le(),
            }),
            EventKind::OnDemandPayload => Event::OnDemandPayload(OnDemandPayload {
                frames: buf.get_u64_le(),
                current_time: buf.get_i64_le(),
            }),
            EventKind::AckServerQueryNoop => Event::AckServerQueryNoop,
            EventKind::AckSourceCodeNotAvailable => Event::AckSourceCodeNotAvailable {
                id: buf.get_u32_le(),
            },
            EventKind::AckSymbolCodeNotAvailable => Event::AckSymbolCodeNotAvailable {
                addr: buf.get_u64_le(),
            },
        };
        Ok(event)
    }
}

#[inline]
fn need(available: usize, needed: usize) -> Result<()> {
    if available < needed {
        return Err(ProtocolError::Truncated { needed, available });
    }
    Ok(())
}

fn get_short(buf: &mut impl Buf) -> Result<Payload> {
    need(buf.remaining(), 2)?;
    let len = buf.get_u16_le() as usize;
    get_bytes(buf, len)
}

fn get_long(buf: &mut impl Buf) -> Result<Payload> {
    need(buf.remaining(), 4)?;
    let len = buf.get_u32_le() as usize;
    get_bytes(buf, len)
}

fn get_bytes(buf: &mut impl Buf, len: usize) -> Result<Payload> {
    need(buf.remaining(), len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(Payload::new(bytes))
}
