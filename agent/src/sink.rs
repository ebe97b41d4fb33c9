use mpscbuf::Producer;
use protocol::Event;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use systrace::EventSink;

use crate::profiler::Shared;

/// Feeds system-tracing samples into the context's queue through a
/// producer owned by the sampling thread.
pub(crate) struct SystraceSink {
    shared: Arc<Shared>,
    producer: Producer<Event>,
}

impl SystraceSink {
    pub fn new(shared: Arc<Shared>) -> Self {
        let producer = shared.queue.producer(0);
        SystraceSink { shared, producer }
    }
}

impl EventSink for SystraceSink {
    fn emit(&mut self, event: Event) {
        self.producer.push(event);
    }

    /// Samples taken while no peer listens would only be cleared again.
    fn is_active(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}
