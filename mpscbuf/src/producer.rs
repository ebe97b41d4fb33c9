use crate::common::{unlikely, Block, SubQueue};
use crate::consumer::Shared;
use crate::sync::{Arc, Ordering};
use std::marker::PhantomData;

/// Writing end owned by one thread.
///
/// Writes never block and never fail: when the current block is full a new
/// one is linked behind it. Values become visible to the consumer only when
/// the [`Reservation`] they were written through is dropped.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    sub: Arc<SubQueue<T>>,
    tail: *mut Block<T>,
    committed: usize,
    // Not Sync: the tail cursor is single-threaded state.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

unsafe impl<T: Send> Send for Producer<T> {}

impl<T> Producer<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, sub: Arc<SubQueue<T>>, tail: *mut Block<T>) -> Self {
        Producer {
            shared,
            sub,
            tail,
            committed: 0,
            _not_sync: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.sub.id
    }

    /// Caller-chosen tag handed back with every drained item.
    pub fn tag(&self) -> u64 {
        self.sub.tag
    }

    /// True once the consumer is gone; further writes are dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Reserves `count` contiguous slots. Everything written through the
    /// returned reservation is published together when it is dropped.
    pub fn reserve(&mut self, count: usize) -> Reservation<'_, T> {
        let count = count.max(1);
        let discard = self.shared.is_closed();
        if !discard {
            let capacity = unsafe { (*self.tail).capacity() };
            if unlikely(self.committed + count > capacity) {
                self.grow(count);
            }
        }
        Reservation {
            start: self.committed,
            len: count,
            filled: 0,
            discard,
            producer: self,
        }
    }

    /// Single-slot shorthand for `reserve(1)` + write + commit.
    pub fn push(&mut self, value: T) {
        let mut reservation = self.reserve(1);
        let _ = reservation.write(value);
    }

    fn grow(&mut self, count: usize) {
        let capacity = self.shared.block_capacity.max(count);
        let block = Block::alloc(capacity);
        // Everything in the old block is committed: reservations borrow the
        // producer mutably and commit on drop.
        unsafe { (*self.tail).next.store(block, Ordering::Release) };
        self.tail = block;
        self.committed = 0;
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.sub.retired.store(true, Ordering::Release);
    }
}

pub struct Reservation<'a, T> {
    producer: &'a mut Producer<T>,
    start: usize,
    len: usize,
    filled: usize,
    discard: bool,
}

impl<T> Reservation<'_, T> {
    /// Writes the next slot. Hands the value back if every reserved slot is
    /// already filled.
    pub fn write(&mut self, value: T) -> Result<(), T> {
        if self.filled == self.len {
            return Err(value);
        }
        if self.discard {
            drop(value);
        } else {
            unsafe {
                (*self.producer.tail).write(self.start + self.filled, value);
            }
        }
        self.filled += 1;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.len - self.filled
    }

    pub fn commit(self) {}

    /// Drops everything written so far instead of publishing it.
    pub fn discard(mut self) {
        if !self.discard {
            for idx in self.start..self.start + self.filled {
                unsafe { drop((*self.producer.tail).take(idx)) };
            }
        }
        self.filled = 0;
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.discard || self.filled == 0 {
            return;
        }
        let producer = &mut *self.producer;
        producer.committed = self.start + self.filled;
        unsafe {
            (*producer.tail)
                .committed
                .store(producer.committed, Ordering::Release);
        }
    }
}
