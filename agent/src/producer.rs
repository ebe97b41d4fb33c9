//! Per-thread queue producers.
//!
//! Each thread gets one [`Producer`] per profiler context on first use and
//! keeps it until the thread exits. Dropping it at thread exit retires the
//! producer, and the transport reclaims it once drained.

use mpscbuf::{Producer, Registry};
use protocol::Event;
use std::cell::{Cell, RefCell};

struct Handle {
    context: u64,
    producer: Producer<Event>,
}

thread_local! {
    static HANDLES: RefCell<Vec<Handle>> = const { RefCell::new(Vec::new()) };
    static THREAD_ID: Cell<u32> = const { Cell::new(0) };
}

/// Kernel id of the calling thread, cached after the first call.
pub fn current_thread_id() -> u32 {
    THREAD_ID
        .try_with(|cached| {
            let id = cached.get();
            if id != 0 {
                return id;
            }
            let id = nix::unistd::gettid().as_raw() as u32;
            cached.set(id);
            id
        })
        .unwrap_or_else(|_| nix::unistd::gettid().as_raw() as u32)
}

/// Runs `f` with this thread's producer for `context`, creating it on first
/// use. Returns `None` when no producer is reachable: during thread teardown,
/// or re-entered from a signal handler interrupting another call.
pub(crate) fn with_producer<R>(
    context: u64,
    registry: &Registry<Event>,
    f: impl FnOnce(&mut Producer<Event>) -> R,
) -> Option<R> {
    HANDLES
        .try_with(|handles| {
            let mut handles = handles.try_borrow_mut().ok()?;
            let idx = match handles.iter().position(|h| h.context == context) {
                Some(idx) => idx,
                None => {
                    // Contexts that shut down leave closed producers behind.
                    handles.retain(|h| !h.producer.is_closed());
                    handles.push(Handle {
                        context,
                        producer: registry.producer(current_thread_id() as u64),
                    });
                    handles.len() - 1
                }
            };
            Some(f(&mut handles[idx].producer))
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpscbuf::Consumer;
    use protocol::event::ZoneEnd;
    use rstest::*;
    use std::thread;

    fn zone_end(time: i64) -> Event {
        Event::ZoneEnd(ZoneEnd { time })
    }

    #[rstest]
    fn test_one_producer_per_thread_and_context() {
        let mut consumer = Consumer::<Event>::new(64).unwrap();
        let registry = consumer.registry();

        for time in 0..3 {
            with_producer(1001, &registry, |p| p.push(zone_end(time))).unwrap();
        }
        assert_eq!(consumer.producers(), 1);

        let mut tags = Vec::new();
        consumer.drain(usize::MAX, |tag, _| tags.push(tag));
        assert_eq!(tags, vec![current_thread_id() as u64; 3]);
    }

    #[rstest]
    fn test_thread_exit_retires_producer() {
        let mut consumer = Consumer::<Event>::new(64).unwrap();
        let registry = consumer.registry();

        thread::spawn(move || {
            with_producer(1002, &registry, |p| p.push(zone_end(1))).unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(consumer.drain(usize::MAX, |_, _| {}), 1);
        assert_eq!(consumer.producers(), 0);
    }

    #[rstest]
    fn test_closed_context_is_pruned() {
        let first = Consumer::<Event>::new(64).unwrap();
        with_producer(1003, &first.registry(), |p| p.push(zone_end(1))).unwrap();
        drop(first);

        let mut second = Consumer::<Event>::new(64).unwrap();
        with_producer(1004, &second.registry(), |p| p.push(zone_end(2))).unwrap();
        let stale = HANDLES.with(|h| h.borrow().iter().any(|h| h.context == 1003));
        assert!(!stale);
        assert_eq!(second.drain(usize::MAX, |_, _| {}), 1);
    }

    #[rstest]
    fn test_thread_id_is_stable() {
        let id = current_thread_id();
        assert_eq!(id, current_thread_id());
        let other = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(id, other);
    }
}
