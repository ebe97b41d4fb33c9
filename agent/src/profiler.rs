use mpscbuf::{Consumer, Registry};
use parking_lot::Mutex;
use protocol::event::{
    AppInfo, Callstack, CrashReport, FiberEnter, FiberLeave, FrameMark, GpuContextName,
    GpuNewContext, GpuTime, GpuZoneBegin, GpuZoneEnd, LockAnnounce, LockEvent, LockName,
    LockTerminate, MemAlloc, MemFree, Message, PlotData, ZoneBegin, ZoneColor, ZoneEnd, ZoneText,
    ZoneValue,
};
use protocol::{Event, Payload, WelcomeFlags, WelcomeMessage, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use systrace::{NoopSampler, SamplerThread, SystemSampler};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::host::HostInfo;
use crate::listener::Listener;
use crate::producer::{current_thread_id, with_producer};
use crate::queue::{SerialEntry, SerialQueue};
use crate::registry::{NameRegistry, SourceLocationData};
use crate::sink::SystraceSink;
use crate::symbolizer::{NoSymbolizer, Symbolizer};
use crate::timer::{self, Calibration};
use crate::transport::{Transport, TransportState};
use crate::{get_timestamp_ns, Result};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

const CRASH_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Metadata kept for replay to the next peer.
pub(crate) struct StickyBuffer {
    pub entries: Vec<SerialEntry>,
    limit: usize,
    overflowed: bool,
}

/// State shared by every [`Profiler`] clone, the transport thread and the
/// system-tracing thread.
pub(crate) struct Shared {
    pub id: u64,
    pub config: Config,
    pub queue: Registry<Event>,
    pub serial: SerialQueue,
    pub sticky: Mutex<StickyBuffer>,
    pub names: NameRegistry,
    pub symbolizer: Arc<dyn Symbolizer>,
    pub welcome: WelcomeMessage,
    pub port: u16,
    pub shutdown: Arc<AtomicBool>,
    pub connected: AtomicBool,
    pub connection_id: AtomicU64,
    pub state: AtomicU8,
    pub transport_done: AtomicBool,
    pub transport_tid: AtomicI32,
    pub sampler_tid: OnceLock<Arc<AtomicI32>>,
    pub frame_count: AtomicU64,
    next_lock: AtomicU32,
    next_gpu_context: AtomicU8,
}

impl Shared {
    /// Whether recorded events can reach a peer. Outside on-demand mode
    /// everything is queued; the transport clears it while nobody listens.
    pub fn is_active(&self) -> bool {
        !self.config.on_demand || self.connected.load(Ordering::Acquire)
    }

    /// A zone begun under an earlier peer must not be continued for the
    /// current one in on-demand mode.
    fn zone_live(&self, token: ZoneToken) -> bool {
        !self.config.on_demand || self.connection_id.load(Ordering::Acquire) == token.connection
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn push(&self, event: Event) {
        with_producer(self.id, &self.queue, |producer| producer.push(event));
    }

    /// Publishes `events` together so no other record of this thread can
    /// land between them.
    fn push_group<const N: usize>(&self, events: [Event; N]) {
        with_producer(self.id, &self.queue, |producer| {
            let mut reservation = producer.reserve(N);
            for event in events {
                let _ = reservation.write(event);
            }
        });
    }

    fn push_sticky(&self, event: Event) {
        let thread = current_thread_id();
        let mut sticky = self.sticky.lock();
        if sticky.entries.len() < sticky.limit {
            sticky.entries.push(SerialEntry {
                thread,
                event: event.clone(),
            });
        } else if !sticky.overflowed {
            sticky.overflowed = true;
            warn!(limit = sticky.limit, "sticky metadata limit reached, no longer retained");
        }
        // Under the sticky lock so a concurrent connect either replays this
        // entry or sees it queued, never both.
        if self.connected.load(Ordering::Acquire) {
            self.push(event);
        }
    }

    fn push_serial(&self, make: impl FnOnce(i64, u32) -> Event) {
        if !self.is_active() {
            return;
        }
        let thread = current_thread_id();
        self.serial.push_with(thread, |time| make(time, thread));
    }

    /// Routes an event by kind: sticky metadata, serial kinds, or the
    /// calling thread's queue.
    pub fn submit(&self, event: Event) {
        let kind = event.kind();
        if kind.is_sticky() {
            self.push_sticky(event);
            return;
        }
        if !self.is_active() {
            return;
        }
        if kind.is_serial() {
            self.serial.push(current_thread_id(), event);
        } else {
            self.push(event);
        }
    }

    /// Crash path: the thread-local producer may be mid-use by the faulting
    /// frame, so fall back to the serial queue with a bounded lock wait.
    pub fn submit_crash(&self, text: String, callstack: Option<Payload>) {
        let mut events = Vec::with_capacity(3);
        if let Some(frames) = callstack {
            events.push(Event::Callstack(Callstack { frames }));
        }
        events.push(Event::CrashReport(CrashReport {
            time: get_timestamp_ns(),
            text: Payload::text(&text),
        }));
        events.push(Event::Crash);

        let mut pending = Some(events);
        let queued = with_producer(self.id, &self.queue, |producer| {
            if let Some(events) = pending.take() {
                let mut reservation = producer.reserve(events.len());
                for event in events {
                    let _ = reservation.write(event);
                }
            }
        });
        if queued.is_some() {
            return;
        }
        let thread = current_thread_id();
        for event in pending.into_iter().flatten() {
            if !self.serial.try_push(thread, event, CRASH_LOCK_TIMEOUT) {
                warn!("crash report dropped, serial queue locked");
                return;
            }
        }
    }

    /// Thread ids that must keep running while a crash is reported.
    pub fn worker_tids(&self) -> Vec<i32> {
        let mut tids = vec![self.transport_tid.load(Ordering::Acquire)];
        if let Some(tid) = self.sampler_tid.get() {
            tids.push(tid.load(Ordering::Acquire));
        }
        tids.retain(|&tid| tid != 0);
        tids
    }
}

fn short_text(text: &str) -> Payload {
    let mut end = text.len().min(u16::MAX as usize);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Payload::text(&text[..end])
}

/// Handle used by application code to record events. Cheap to clone and
/// safe to share between threads; every clone feeds the same context.
#[derive(Clone)]
pub struct Profiler {
    shared: Arc<Shared>,
}

impl Profiler {
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Enqueues a fully built event. Never blocks beyond the serial queue's
    /// short critical section.
    pub fn submit(&self, event: Event) {
        self.shared.submit(event);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Increments on every accepted peer.
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Polls until a peer is streaming or `timeout` elapses.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.is_connected()
    }

    pub fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }

    pub fn has_shutdown_finished(&self) -> bool {
        self.shared.transport_done.load(Ordering::Acquire)
    }

    pub fn zone(&self, location: &'static SourceLocationData) -> ZoneGuard<'_> {
        ZoneGuard {
            profiler: self,
            token: self.zone_begin(location),
        }
    }

    /// Zone whose begin carries a call stack, innermost frame first.
    pub fn zone_with_callstack(
        &self,
        location: &'static SourceLocationData,
        frames: &[u64],
    ) -> ZoneGuard<'_> {
        if !self.shared.is_active() {
            return ZoneGuard {
                profiler: self,
                token: None,
            };
        }
        let connection = self.connection_id();
        let srcloc = self.shared.names.location(location);
        self.shared.push_group([
            Event::Callstack(Callstack {
                frames: Payload::from_addresses(frames),
            }),
            Event::ZoneBeginCallstack(ZoneBegin {
                time: get_timestamp_ns(),
                srcloc,
            }),
        ]);
        ZoneGuard {
            profiler: self,
            token: Some(ZoneToken { connection }),
        }
    }

    /// Begins a zone that is ended explicitly with [`zone_end`](Self::zone_end)
    /// on the same thread. Returns `None` when nothing was recorded.
    pub fn zone_begin(&self, location: &'static SourceLocationData) -> Option<ZoneToken> {
        if !self.shared.is_active() {
            return None;
        }
        let connection = self.connection_id();
        let srcloc = self.shared.names.location(location);
        self.shared.push(Event::ZoneBegin(ZoneBegin {
            time: get_timestamp_ns(),
            srcloc,
        }));
        Some(ZoneToken { connection })
    }

    pub fn zone_end(&self, token: ZoneToken) {
        if self.shared.zone_live(token) {
            self.shared.push(Event::ZoneEnd(ZoneEnd {
                time: get_timestamp_ns(),
            }));
        }
    }

    /// Attaches text to the innermost open zone of this thread.
    pub fn zone_text(&self, token: ZoneToken, text: &str) {
        if self.shared.zone_live(token) {
            self.shared.push(Event::ZoneText(ZoneText {
                text: short_text(text),
            }));
        }
    }

    pub fn message(&self, text: &str) {
        self.message_color(text, 0);
    }

    pub fn message_color(&self, text: &str, color: u32) {
        if self.shared.is_active() {
            self.shared.push(Event::Message(Message {
                time: get_timestamp_ns(),
                color,
                text: short_text(text),
            }));
        }
    }

    /// Free-form application description, replayed to every peer.
    pub fn app_info(&self, text: &str) {
        self.shared.push_sticky(Event::MessageAppInfo(AppInfo {
            time: get_timestamp_ns(),
            text: short_text(text),
        }));
    }

    pub fn frame_mark(&self) {
        self.shared.frame_count.fetch_add(1, Ordering::Relaxed);
        if self.shared.is_active() {
            self.shared.push(Event::FrameMark(FrameMark {
                time: get_timestamp_ns(),
                name: 0,
            }));
        }
    }

    /// Marks the end of a frame in a secondary, named frame set.
    pub fn frame_mark_named(&self, name: &'static str) {
        if self.shared.is_active() {
            let name = self.shared.names.intern(name);
            self.shared.push(Event::FrameMark(FrameMark {
                time: get_timestamp_ns(),
                name,
            }));
        }
    }

    pub fn plot(&self, name: &'static str, value: f64) {
        if self.shared.is_active() {
            let name = self.shared.names.intern(name);
            self.shared.push(Event::PlotData(PlotData {
                name,
                time: get_timestamp_ns(),
                value,
            }));
        }
    }

    pub fn alloc(&self, ptr: u64, size: u64) {
        self.shared.push_serial(|time, thread| {
            Event::MemAlloc(MemAlloc {
                time,
                thread,
                ptr,
                size,
            })
        });
    }

    pub fn free(&self, ptr: u64) {
        self.shared
            .push_serial(|time, thread| Event::MemFree(MemFree { time, thread, ptr }));
    }

    /// Declares a lock and returns its id for the other lock calls.
    pub fn lock_announce(&self, location: &'static SourceLocationData, lock_type: u8) -> u32 {
        let id = self.shared.next_lock.fetch_add(1, Ordering::Relaxed);
        let srcloc = self.shared.names.location(location);
        // Serial so the announcement cannot trail the lock's first wait.
        self.shared.push_serial(|time, _| {
            Event::LockAnnounce(LockAnnounce {
                id,
                time,
                srcloc,
                lock_type,
            })
        });
        id
    }

    pub fn lock_terminate(&self, id: u32) {
        self.shared
            .push_serial(|time, _| Event::LockTerminate(LockTerminate { id, time }));
    }

    pub fn lock_wait(&self, id: u32) {
        self.shared
            .push_serial(|time, thread| Event::LockWait(LockEvent { thread, id, time }));
    }

    pub fn lock_obtain(&self, id: u32) {
        self.shared
            .push_serial(|time, thread| Event::LockObtain(LockEvent { thread, id, time }));
    }

    pub fn lock_release(&self, id: u32) {
        self.shared
            .push_serial(|time, thread| Event::LockRelease(LockEvent { thread, id, time }));
    }

    pub fn lock_name(&self, id: u32, name: &str) {
        self.shared.push_sticky(Event::LockName(LockName {
            id,
            name: short_text(name),
        }));
    }

    /// Registers a GPU timeline. `period` is nanoseconds per GPU tick.
    pub fn gpu_new_context(&self, gpu_time: i64, period: f32, flags: u8, gpu_type: u8) -> u8 {
        let context = self.shared.next_gpu_context.fetch_add(1, Ordering::Relaxed);
        self.shared.push_serial(|cpu_time, thread| {
            Event::GpuNewContext(GpuNewContext {
                cpu_time,
                gpu_time,
                thread,
                period,
                context,
                flags,
                gpu_type,
            })
        });
        context
    }

    pub fn gpu_zone_begin(
        &self,
        context: u8,
        location: &'static SourceLocationData,
        query_id: u16,
    ) {
        let srcloc = self.shared.names.location(location);
        self.shared.push_serial(|cpu_time, thread| {
            Event::GpuZoneBegin(GpuZoneBegin {
                cpu_time,
                srcloc,
                thread,
                query_id,
                context,
            })
        });
    }

    pub fn gpu_zone_end(&self, context: u8, query_id: u16) {
        self.shared.push_serial(|cpu_time, thread| {
            Event::GpuZoneEnd(GpuZoneEnd {
                cpu_time,
                thread,
                query_id,
                context,
            })
        });
    }

    /// Result of a GPU timer query. Must be reported in GPU time order.
    pub fn gpu_time(&self, context: u8, query_id: u16, gpu_time: i64) {
        if self.shared.is_active() {
            self.shared.push(Event::GpuTime(GpuTime {
                gpu_time,
                query_id,
                context,
            }));
        }
    }

    pub fn gpu_context_name(&self, context: u8, name: &str) {
        self.shared.push_sticky(Event::GpuContextName(GpuContextName {
            context,
            name: short_text(name),
        }));
    }

    pub fn fiber_enter(&self, fiber: &'static str) {
        let fiber = self.shared.names.intern(fiber);
        self.shared.push_serial(|time, thread| {
            Event::FiberEnter(FiberEnter {
                time,
                fiber,
                thread,
            })
        });
    }

    pub fn fiber_leave(&self) {
        self.shared
            .push_serial(|time, thread| Event::FiberLeave(FiberLeave { time, thread }));
    }

    pub fn set_thread_name(&self, name: &str) {
        self.shared
            .names
            .set_thread_name(current_thread_id(), name);
    }

    /// Exposes a tunable the peer can change at runtime.
    pub fn parameter(&self, idx: u32, name: &'static str, is_bool: bool, value: i32) {
        let setup = self.shared.names.add_parameter(idx, name, is_bool, value);
        self.shared.push_sticky(Event::ParameterSetup(setup));
    }

    pub fn on_parameter_change(&self, callback: impl Fn(u32, i32) + Send + Sync + 'static) {
        self.shared
            .names
            .set_parameter_callback(Arc::new(callback));
    }

    pub fn parameter_value(&self, idx: u32) -> Option<i32> {
        self.shared.names.parameter(idx).map(|(_, value)| value)
    }
}

/// Proof that a zone begin was recorded, and for which peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneToken {
    connection: u64,
}

/// Open zone. Dropping it records the end.
#[must_use = "the zone ends when the guard is dropped"]
pub struct ZoneGuard<'a> {
    profiler: &'a Profiler,
    token: Option<ZoneToken>,
}

impl ZoneGuard<'_> {
    /// False when the begin was not recorded (on-demand mode without a peer).
    pub fn is_active(&self) -> bool {
        self.token.is_some()
    }

    fn live(&self) -> bool {
        self.token.is_some_and(|token| self.profiler.shared.zone_live(token))
    }

    pub fn text(&self, text: &str) {
        if let Some(token) = self.token {
            self.profiler.zone_text(token, text);
        }
    }

    pub fn name(&self, name: &str) {
        if self.live() {
            self.profiler.shared.push(Event::ZoneName(ZoneText {
                text: short_text(name),
            }));
        }
    }

    pub fn color(&self, color: u32) {
        if self.live() {
            self.profiler
                .shared
                .push(Event::ZoneColor(ZoneColor { color }));
        }
    }

    pub fn value(&self, value: u64) {
        if self.live() {
            self.profiler
                .shared
                .push(Event::ZoneValue(ZoneValue { value }));
        }
    }
}

impl Drop for ZoneGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            self.profiler.zone_end(token);
        }
    }
}

fn welcome_message(
    config: &Config,
    host: &HostInfo,
    calibration: &Calibration,
    init_begin: i64,
    init_end: i64,
    sampling_period: u64,
) -> WelcomeMessage {
    let mut flags = WelcomeFlags::default();
    flags.set(WelcomeFlags::ON_DEMAND, config.on_demand);
    flags.set(WelcomeFlags::CODE_TRANSFER, config.code_transfer);
    flags.set(WelcomeFlags::IDENTIFY_SAMPLES, sampling_period > 0);
    WelcomeMessage {
        timer_mul: calibration.timer_mul,
        init_begin,
        init_end,
        delay: calibration.delay,
        resolution: calibration.resolution,
        epoch: host.epoch,
        exec_time: host.exec_time,
        pid: host.pid,
        sampling_period: sampling_period as i64,
        flags,
        cpu_arch: host.cpu_arch,
        cpu_manufacturer: host.cpu_manufacturer,
        cpu_id: host.cpu_id,
        program_name: host.program_name.clone(),
        host_info: host.host_info.clone(),
    }
}

/// Owns the worker threads of one profiler context. Dropping it shuts the
/// context down and waits for the final flush.
pub struct Agent {
    profiler: Profiler,
    transport: Option<JoinHandle<()>>,
    sampler: Option<SamplerThread>,
}

impl Agent {
    pub fn start(config: Config) -> Result<Self> {
        Self::with_symbolizer(config, Arc::new(NoSymbolizer))
    }

    pub fn with_symbolizer(config: Config, symbolizer: Arc<dyn Symbolizer>) -> Result<Self> {
        let init_begin = get_timestamp_ns();
        timer::check_invariant_clock(config.invariant_check);

        let consumer = Consumer::<Event>::new(config.queue_block)?;
        let listener = Listener::bind(&config)?;
        let calibration = timer::calibrate()?;
        let host = HostInfo::detect(config.program_name.as_deref());
        let sampler = systrace::detect(&config.systrace);
        let sampling_period = sampler.sampling_period_ns();
        let welcome = welcome_message(
            &config,
            &host,
            &calibration,
            init_begin,
            get_timestamp_ns(),
            sampling_period,
        );

        let shared = Arc::new(Shared {
            id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            queue: consumer.registry(),
            serial: SerialQueue::default(),
            sticky: Mutex::new(StickyBuffer {
                entries: Vec::new(),
                limit: config.sticky_limit,
                overflowed: false,
            }),
            names: NameRegistry::default(),
            symbolizer,
            welcome,
            port: listener.port(),
            shutdown: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
            connection_id: AtomicU64::new(0),
            state: AtomicU8::new(TransportState::Listening as u8),
            transport_done: AtomicBool::new(false),
            transport_tid: AtomicI32::new(0),
            sampler_tid: OnceLock::new(),
            frame_count: AtomicU64::new(0),
            next_lock: AtomicU32::new(0),
            next_gpu_context: AtomicU8::new(0),
            config,
        });

        let sampler = spawn_sampler(&shared, sampler);

        let transport = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("streamtrace-transport".to_string())
                .spawn(move || Transport::new(shared, consumer, listener).run())?
        };

        info!(
            port = shared.port,
            protocol = PROTOCOL_VERSION,
            on_demand = shared.config.on_demand,
            "streamtrace agent started"
        );

        Ok(Agent {
            profiler: Profiler { shared },
            transport: Some(transport),
            sampler,
        })
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn port(&self) -> u16 {
        self.profiler.port()
    }

    /// Requests shutdown and waits for the transport's final flush.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.profiler.request_shutdown();
        if let Some(handle) = self.transport.take() {
            if handle.join().is_err() {
                warn!("transport thread panicked");
            }
        }
        if let Some(sampler) = self.sampler.take() {
            sampler.stop();
        }
        debug!("agent stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_sampler(
    shared: &Arc<Shared>,
    sampler: Box<dyn SystemSampler>,
) -> Option<SamplerThread> {
    if sampler.name() == NoopSampler.name() {
        return None;
    }
    let sink = SystraceSink::new(shared.clone());
    match SamplerThread::spawn(sampler, sink, shared.shutdown.clone()) {
        Ok(thread) => {
            let _ = shared.sampler_tid.set(thread.tid_handle());
            Some(thread)
        }
        Err(e) => {
            warn!(error = ?e, "failed to start system tracing thread");
            None
        }
    }
}
