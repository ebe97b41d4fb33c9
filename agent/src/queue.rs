//! Ordering-preserving side channel.
//!
//! Lock, allocator, GPU and fiber events must reach the peer in the exact
//! order they happened across threads. Producers append under a short lock
//! and take the timestamp while holding it, so the buffer is sorted by time.
//! The transport swaps the whole buffer out and encodes it off-lock.

use parking_lot::Mutex;
use protocol::Event;
use std::time::Duration;

use crate::get_timestamp_ns;

#[derive(Debug)]
pub(crate) struct SerialEntry {
    pub thread: u32,
    pub event: Event,
}

#[derive(Default)]
pub(crate) struct SerialQueue {
    pending: Mutex<Vec<SerialEntry>>,
}

impl SerialQueue {
    /// Appends the event built from the current time.
    pub fn push_with(&self, thread: u32, make: impl FnOnce(i64) -> Event) {
        let mut pending = self.pending.lock();
        let event = make(get_timestamp_ns());
        pending.push(SerialEntry { thread, event });
    }

    pub fn push(&self, thread: u32, event: Event) {
        self.pending.lock().push(SerialEntry { thread, event });
    }

    /// Like [`push`](Self::push) but gives up when the lock is not free
    /// within `timeout`. Used where the caller may already hold the lock.
    pub fn try_push(&self, thread: u32, event: Event, timeout: Duration) -> bool {
        match self.pending.try_lock_for(timeout) {
            Some(mut pending) => {
                pending.push(SerialEntry { thread, event });
                true
            }
            None => false,
        }
    }

    /// Swaps the pending entries into `out`, which must be empty. Returns
    /// false when the lock could not be taken within `timeout`.
    pub fn swap(&self, out: &mut Vec<SerialEntry>, timeout: Duration) -> bool {
        debug_assert!(out.is_empty());
        match self.pending.try_lock_for(timeout) {
            Some(mut pending) => {
                std::mem::swap(&mut *pending, out);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
