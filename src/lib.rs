//! Bytepipe: an asynchronous single-producer single-consumer byte pipe
//! backed by a bounded circular buffer with in-place zero-copy access.
//!
//! A [`BytePipe`] couples a writing task to a reading task without blocking
//! OS threads: the producer pushes bytes with the `write_*` family, the
//! consumer pulls them with `read_*`, and either side suspends cooperatively
//! when the ring is full or empty.
//!
//! # Overview
//!
//! ```text
//!  PRODUCER TASK                                              CONSUMER TASK
//! ┌──────────────┐                                          ┌──────────────┐
//! │ write_u32    │                                          │ read_u32     │
//! │ write_fully  │                                          │ read_fully   │
//! │ write_with   │                                          │ read_with    │
//! └──────┬───────┘                                          └──────▲───────┘
//!        │              ┌───────────────────────┐                  │
//!        │   reserve    │ ring buffer (C bytes) │     reserve      │
//!        └─────────────▶│  ┌─────────────────┐  │──────────────────┘
//!                       │  │####______####### │ │
//!                       │  └─────────────────┘  │
//!                       │   ▲write        ▲read │
//!                       └───┼─────────────┼─────┘
//!                           │             │
//!                 pending-to-flush   available-for-read
//!                           │             │
//!                           └── flush() ──┘
//! ```
//!
//! Occupancy is tracked by three atomic counters (available-for-read,
//! available-for-write, pending-to-flush) packed into a single word, so every
//! reservation is one CAS. Written bytes stay *pending* until
//! [`flush()`](`BytePipe::flush`) promotes them to readable — or implicitly
//! after every write when the pipe is built with
//! [`auto_flush`](`PipeBuilder::auto_flush`). A full producer never
//! deadlocks on its own invisible bytes: the pipe flushes before parking.
//!
//! # Features
//!
//! - **Suspending byte I/O**: primitives (big-endian on the wire), bulk
//!   transfers, [`Packet`] aggregates and UTF-8 line helpers
//! - **Zero-copy visitors**: [`read_with`](`BytePipe::read_with`) /
//!   [`write_with`](`BytePipe::write_with`) hand the caller a view of the
//!   ring itself; unconsumed reservations are refunded
//! - **Backpressure**: a bounded ring of 4088 bytes by default; both sides
//!   park and wake through single-cell suspension slots
//! - **Splicing**: [`join_from`](`BytePipe::join_from`) re-routes one pipe's
//!   producer end into another, with optional close propagation
//! - **Pooled buffers**: the ring is leased from a [`BufferPool`] on first
//!   write and recycled once drained or terminated
//! - **Cancellation**: [`attach_token`](`BytePipe::attach_token`) ties the
//!   pipe to a `CancellationToken` in either direction
//!
//! # Quick start
//!
//! ```no_run
//! use bytepipe::BytePipe;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bytepipe::Error> {
//!     let pipe = BytePipe::new(true);
//!
//!     let producer = pipe.clone();
//!     tokio::spawn(async move {
//!         producer.write_u32(0xDEADBEEF).await?;
//!         producer.write_fully(b"hello").await?;
//!         producer.close();
//!         Ok::<_, bytepipe::Error>(())
//!     });
//!
//!     assert_eq!(pipe.read_u32().await?, 0xDEADBEEF);
//!     let mut buf = [0u8; 5];
//!     pipe.read_fully(&mut buf).await?;
//!     assert!(pipe.is_closed_for_read());
//!     Ok(())
//! }
//! ```
//!
//! # Single producer, single consumer
//!
//! The handle is cheaply cloneable, but at most one task may act as producer
//! and one as consumer at any instant. A second concurrent reader or writer
//! is a usage error, detected at the lease or at the suspension slot and
//! reported as [`Error::Busy`].
//!
//! # Closing
//!
//! [`close()`](`BytePipe::close`) is clean: the consumer drains what was
//! flushed, then sees end-of-stream, while further writes fail.
//! [`fail()`](`BytePipe::fail`) records a cause that both sides observe and
//! may discard buffered bytes. [`cancel()`](`BytePipe::cancel`) is a close
//! with [`Error::Cancelled`]. Close never leaves a parked task behind: both
//! suspension slots are resumed.

mod buffers;
mod error;
mod pipe;
mod pool;
mod ring;
mod sync;

pub use buffers::Packet;
pub use error::{Cause, Error};
pub use pipe::{
    BytePipe, ByteOrder, DEFAULT_CAPACITY, DEFAULT_RESERVED, PipeBuilder, WriteSession, pipe,
};
pub use pool::BufferPool;
