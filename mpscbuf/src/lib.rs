//! # mpscbuf - Multi-Producer Single-Consumer Queue
//!
//! Unbounded queue of typed values with one writing end per thread and a
//! single reader. Each producer owns a chain of fixed-size blocks, so writes
//! never contend with each other and never block on the reader.
//!
//! ## Creating a Consumer
//!
//! ```rust
//! use mpscbuf::Consumer;
//!
//! let consumer = Consumer::<u64>::new(1024)?; // 1024 slots per block
//! # Ok::<(), mpscbuf::MpscBufError>(())
//! ```
//!
//! ## Creating Producers
//!
//! Producers come from a [`Registry`], which can be cloned and moved to
//! other threads. The tag is returned with every value the producer writes.
//!
//! ```rust
//! use mpscbuf::Consumer;
//!
//! let consumer = Consumer::<u64>::new(1024)?;
//! let registry = consumer.registry();
//!
//! std::thread::spawn(move || {
//!     let mut producer = registry.producer(42);
//!     producer.push(1);
//! })
//! .join()
//! .unwrap();
//! # Ok::<(), mpscbuf::MpscBufError>(())
//! ```
//!
//! ### Writing Groups
//!
//! Values written through one reservation become visible together when the
//! reservation is dropped.
//!
//! ```rust
//! # use mpscbuf::Consumer;
//! # let consumer = Consumer::<u64>::new(1024)?;
//! let mut producer = consumer.registry().producer(0);
//! let mut reserved = producer.reserve(2);
//! reserved.write(10).unwrap();
//! reserved.write(20).unwrap();
//! reserved.commit();
//! # Ok::<(), mpscbuf::MpscBufError>(())
//! ```
//!
//! ## Reading
//!
//! ```rust
//! # use mpscbuf::Consumer;
//! # let mut consumer = Consumer::<u64>::new(1024)?;
//! # consumer.registry().producer(7).push(3);
//! let drained = consumer.drain(usize::MAX, |tag, value| {
//!     println!("{tag}: {value}");
//! });
//! assert_eq!(drained, 1);
//! # Ok::<(), mpscbuf::MpscBufError>(())
//! ```
//!
//! Producers that were dropped are reclaimed once everything they wrote has
//! been read. Dropping the consumer makes every later write a no-op.

pub use consumer::{Consumer, Registry};
pub use error::MpscBufError;
pub use producer::{Producer, Reservation};

pub(crate) mod common;
pub mod consumer;
pub mod error;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod producer;
pub(crate) mod sync;
