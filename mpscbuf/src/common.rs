// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Block chain shared between one producer and the consumer.

use crate::sync::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

/// Trace events on the write and drain paths, compiled in only with the
/// `trace` feature.
macro_rules! hot_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace")]
        ::tracing::trace!($($arg)*);
    };
}
pub(crate) use hot_trace;

#[inline]
#[cold]
fn cold() {}

#[allow(unused)]
#[inline(always)]
pub(crate) fn likely(b: bool) -> bool {
    if !b {
        cold();
    }
    b
}

#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}

/// Fixed run of slots. Slots below `committed` are initialised and owned by
/// the consumer side; the producer only ever appends.
pub(crate) struct Block<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    pub(crate) committed: CachePadded<AtomicUsize>,
    pub(crate) next: AtomicPtr<Block<T>>,
}

impl<T> Block<T> {
    pub(crate) fn alloc(capacity: usize) -> *mut Block<T> {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        hot_trace!(capacity, "allocating block");
        Box::into_raw(Box::new(Block {
            slots,
            committed: CachePadded::new(AtomicUsize::new(0)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// # Safety
    ///
    /// `idx` must be at or above `committed` and only the owning producer may
    /// call this.
    #[inline(always)]
    pub(crate) unsafe fn write(&self, idx: usize, value: T) {
        (*self.slots[idx].get()).write(value);
    }

    /// # Safety
    ///
    /// `idx` must be below `committed` and not read before; only the consumer
    /// may call this.
    #[inline(always)]
    pub(crate) unsafe fn take(&self, idx: usize) -> T {
        (*self.slots[idx].get()).assume_init_read()
    }
}

/// Per-producer queue: a singly linked chain of blocks. The producer holds
/// the tail, the consumer holds `head`/`read`.
pub(crate) struct SubQueue<T> {
    pub(crate) id: u64,
    pub(crate) tag: u64,
    head: UnsafeCell<*mut Block<T>>,
    read: UnsafeCell<usize>,
    pub(crate) retired: AtomicBool,
}

unsafe impl<T: Send> Send for SubQueue<T> {}
unsafe impl<T: Send> Sync for SubQueue<T> {}

pub(crate) enum DrainState {
    /// Budget ran out; more items may be waiting.
    Budget,
    /// Every committed item was taken.
    Empty,
}

impl<T> SubQueue<T> {
    pub(crate) fn new(id: u64, tag: u64, first: *mut Block<T>) -> Self {
        SubQueue {
            id,
            tag,
            head: UnsafeCell::new(first),
            read: UnsafeCell::new(0),
            retired: AtomicBool::new(false),
        }
    }

    /// Takes up to `budget` committed items in producer order, freeing blocks
    /// the producer has moved past.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    pub(crate) unsafe fn drain<F: FnMut(u64, T)>(
        &self,
        budget: usize,
        f: &mut F,
    ) -> (usize, DrainState) {
        let head = &mut *self.head.get();
        let read = &mut *self.read.get();
        let mut taken = 0;

        loop {
            let block = &**head;
            let committed = block.committed.load(Ordering::Acquire);
            while *read < committed {
                if taken == budget {
                    return (taken, DrainState::Budget);
                }
                let value = block.take(*read);
                *read += 1;
                taken += 1;
                f(self.tag, value);
            }

            let next = block.next.load(Ordering::Acquire);
            if next.is_null() {
                return (taken, DrainState::Empty);
            }
            // The producer commits before linking, so this load is final.
            if *read < block.committed.load(Ordering::Acquire) {
                continue;
            }
            drop(Box::from_raw(*head));
            *head = next;
            *read = 0;
        }
    }
}

impl<T> Drop for SubQueue<T> {
    fn drop(&mut self) {
        let mut block = *self.head.get_mut();
        let mut start = *self.read.get_mut();
        while !block.is_null() {
            unsafe {
                let committed = (*block).committed.load(Ordering::Acquire);
                for idx in start..committed {
                    drop((*block).take(idx));
                }
                let next = (*block).next.load(Ordering::Acquire);
                drop(Box::from_raw(block));
                block = next;
            }
            start = 0;
        }
    }
}
