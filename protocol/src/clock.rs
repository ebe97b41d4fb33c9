/// Timeline a timestamp field belongs to. Each one carries its own reference
/// value on both ends of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TimeCategory {
    /// Zones and plots of the thread named by the last `ThreadContext`.
    Thread,
    /// Context switches, wakeups and vsync: merged system-tracing streams.
    Context,
    /// GPU query results.
    Gpu,
    /// Everything pushed through the serial queue.
    Serial,
}

/// Last transmitted absolute time per category.
///
/// The sender turns absolute times into deltas with [`RefClocks::encode`], the
/// receiver sums them back with [`RefClocks::decode`]. Both sides reset on
/// connect and reset the thread clock on every thread switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefClocks {
    thread: i64,
    context: i64,
    gpu: i64,
    serial: i64,
}

impl RefClocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn reset_thread(&mut self) {
        self.thread = 0;
    }

    pub fn get(&self, category: TimeCategory) -> i64 {
        match category {
            TimeCategory::Thread => self.thread,
            TimeCategory::Context => self.context,
            TimeCategory::Gpu => self.gpu,
            TimeCategory::Serial => self.serial,
        }
    }

    fn slot(&mut self, category: TimeCategory) -> &mut i64 {
        match category {
            TimeCategory::Thread => &mut self.thread,
            TimeCategory::Context => &mut self.context,
            TimeCategory::Gpu => &mut self.gpu,
            TimeCategory::Serial => &mut self.serial,
        }
    }

    /// Delta from the category reference. Times within a category must not go
    /// backwards.
    #[inline]
    pub fn encode(&mut self, category: TimeCategory, time: i64) -> i64 {
        let slot = self.slot(category);
        debug_assert!(
            time >= *slot,
            "non-monotonic {:?} timestamp: {} after {}",
            category,
            time,
            *slot
        );
        let delta = time.wrapping_sub(*slot);
        *slot = time;
        delta
    }

    #[inline]
    pub fn decode(&mut self, category: TimeCategory, delta: i64) -> i64 {
        let slot = self.slot(category);
        *slot = slot.wrapping_add(delta);
        *slot
    }
}
