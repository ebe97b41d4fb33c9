use crate::common::{hot_trace, Block, DrainState, SubQueue};
use crate::sync::{Arc, AtomicBool, AtomicU64, AtomicUsize, Ordering, Spinlock};
use crate::{MpscBufError, Producer};
use crossbeam::utils::CachePadded;
use tracing::debug;

pub(crate) struct Shared<T> {
    incoming: CachePadded<Spinlock<Vec<Arc<SubQueue<T>>>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    closed: AtomicBool,
    pub(crate) block_capacity: usize,
}

impl<T> Shared<T> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Hands out producers attached to one consumer. Cheap to clone.
pub struct Registry<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send> Registry<T> {
    /// Creates a producer. `tag` comes back with every item it writes,
    /// typically the writing thread's id.
    pub fn producer(&self, tag: u64) -> Producer<T> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let first = Block::alloc(self.shared.block_capacity);
        let sub = Arc::new(SubQueue::new(id, tag, first));
        self.shared.incoming.lock().push(sub.clone());
        self.shared.live.fetch_add(1, Ordering::Relaxed);
        Producer::new(self.shared.clone(), sub, first)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Single reading end.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    subs: Vec<Arc<SubQueue<T>>>,
}

impl<T: Send> Consumer<T> {
    pub fn new(block_capacity: usize) -> Result<Self, MpscBufError> {
        if block_capacity == 0 {
            return Err(MpscBufError::InvalidCapacity(block_capacity));
        }
        Ok(Consumer {
            shared: Arc::new(Shared {
                incoming: CachePadded::new(Spinlock::new(Vec::new())),
                next_id: AtomicU64::new(1),
                live: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                block_capacity,
            }),
            subs: Vec::new(),
        })
    }

    pub fn registry(&self) -> Registry<T> {
        Registry {
            shared: self.shared.clone(),
        }
    }

    fn adopt(&mut self) {
        let mut incoming = self.shared.incoming.lock();
        if !incoming.is_empty() {
            hot_trace!(joined = incoming.len(), "adopting producers");
            self.subs.append(&mut incoming);
        }
    }

    /// Takes up to `max` items, one producer at a time. Within a producer
    /// items come out in write order; `f` receives the producer's tag.
    pub fn drain<F: FnMut(u64, T)>(&mut self, max: usize, mut f: F) -> usize {
        self.adopt();
        let mut total = 0;
        let mut idx = 0;
        while idx < self.subs.len() && total < max {
            let sub = &self.subs[idx];
            // Read before draining: a retired producer has published
            // everything it will ever write.
            let retired = sub.retired.load(Ordering::Acquire);
            let (taken, state) = unsafe { sub.drain(max - total, &mut f) };
            total += taken;
            if retired && matches!(state, DrainState::Empty) {
                let sub = self.subs.swap_remove(idx);
                self.shared.live.fetch_sub(1, Ordering::Relaxed);
                debug!(producer = sub.id, "removed retired producer");
                continue;
            }
            idx += 1;
        }
        total
    }

    /// Drops every pending item without handing it out.
    pub fn clear(&mut self) -> usize {
        let dropped = self.drain(usize::MAX, |_, item| drop(item));
        hot_trace!(dropped, "cleared pending items");
        dropped
    }

    /// Producers attached and not yet reclaimed.
    pub fn producers(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rstest::*;
    use std::collections::HashMap;
    use std::thread;

    #[fixture]
    fn consumer() -> Consumer<(u64, u64)> {
        Consumer::new(16).unwrap()
    }

    #[rstest]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            Consumer::<u8>::new(0),
            Err(MpscBufError::InvalidCapacity(0))
        ));
    }

    #[rstest]
    #[case::two_threads(2, 1_000)]
    #[case::eight_threads(8, 500)]
    fn test_concurrent_producers_keep_per_thread_order(
        mut consumer: Consumer<(u64, u64)>,
        #[case] threads: u64,
        #[case] per_thread: u64,
    ) {
        let registry = consumer.registry();
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut producer = registry.producer(t);
                    for i in 0..per_thread {
                        producer.push((t, i));
                    }
                })
            })
            .collect();

        let mut last: HashMap<u64, u64> = HashMap::new();
        let mut total = 0;
        let mut check = |tag: u64, (t, i): (u64, u64)| {
            assert_eq!(tag, t);
            if let Some(prev) = last.insert(t, i) {
                assert_eq!(i, prev + 1, "thread {} out of order", t);
            } else {
                assert_eq!(i, 0);
            }
            total += 1;
        };

        while handles.iter().any(|h| !h.is_finished()) {
            consumer.drain(64, &mut check);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        consumer.drain(usize::MAX, &mut check);

        assert_eq!(total, threads * per_thread);
        assert_eq!(consumer.producers(), 0);
    }

    #[rstest]
    fn test_drain_respects_budget(mut consumer: Consumer<(u64, u64)>) {
        let mut producer = consumer.registry().producer(3);
        for i in 0..40 {
            producer.push((3, i));
        }
        assert_eq!(consumer.drain(25, |_, _| {}), 25);
        assert_eq!(consumer.drain(25, |_, _| {}), 15);
        assert_eq!(consumer.drain(25, |_, _| {}), 0);
    }

    #[rstest]
    fn test_live_producer_is_kept_after_drain(mut consumer: Consumer<(u64, u64)>) {
        let mut producer = consumer.registry().producer(1);
        producer.push((1, 0));
        consumer.drain(usize::MAX, |_, _| {});
        assert_eq!(consumer.producers(), 1);
        producer.push((1, 1));
        drop(producer);
        assert_eq!(consumer.clear(), 1);
        assert_eq!(consumer.producers(), 0);
    }

    #[rstest]
    fn test_clear_spans_producers_joined_since_last_pass(mut consumer: Consumer<(u64, u64)>) {
        let registry = consumer.registry();
        let mut first = registry.producer(1);
        first.push((1, 0));
        assert_eq!(consumer.clear(), 1);

        let mut second = registry.producer(2);
        for i in 0..20 {
            first.push((1, i));
            second.push((2, i));
        }
        assert_eq!(consumer.clear(), 40);
        assert_eq!(consumer.producers(), 2);
        assert_eq!(consumer.drain(usize::MAX, |_, _| {}), 0);
    }
}
