//! The channel core: lease protocol, flush, close and lifecycle.
//!
//! Reader-side operations live in [`read`], writer-side operations in
//! [`write`], splicing in [`join`].

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

use event_listener::{Event, IntoNotification};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Cause, Error},
    pool::BufferPool,
    ring::{Backing, RingCapacity},
    sync::WaitSlot,
};

mod join;
mod read;
mod session;
mod state;
mod text;
mod write;

pub use session::WriteSession;

use join::JoinState;
use state::{ChannelState, SetupError, Tag, Terminate};

/// Default logical ring capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 4088;

/// Default reserved wrap tail, sized to the largest primitive.
pub const DEFAULT_RESERVED: usize = 8;

/// Byte order of the multi-byte primitives on the wire.
///
/// The pipe always transfers primitives big-endian; this type only exists for
/// the deprecated [`set_byte_order`](`BytePipe::set_byte_order`) knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// Sticky close record; the first close or cancel wins and the record never
/// changes afterwards.
#[derive(Debug, Clone)]
struct Closed {
    cause: Option<Error>,
}

impl Closed {
    fn write_error(&self) -> Error {
        self.cause.clone().unwrap_or(Error::Closed)
    }
}

struct Inner {
    state: ChannelState,
    capacity: RingCapacity,
    closed: OnceLock<Closed>,
    joining: OnceLock<JoinState>,
    read_slot: WaitSlot,
    write_slot: WaitSlot,
    closed_event: Event,
    total_read: AtomicU64,
    total_written: AtomicU64,
    auto_flush: bool,
    pool: Arc<BufferPool>,
    token: OnceLock<CancellationToken>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(backing) = self.state.take_backing() {
            self.pool.recycle(backing.into_storage());
        }
    }
}

/// An asynchronous single-producer single-consumer byte pipe.
///
/// One task produces bytes through the `write_*` family, another consumes
/// them through `read_*`; both suspend (without blocking a thread) when the
/// ring is full or empty. The handle is cheaply cloneable and both clones
/// refer to the same channel; strictness is about concurrency, not about
/// which clone is used: at most one task may be reading and at most one
/// writing at any instant.
///
/// Unless the pipe was built with [`auto_flush`](`PipeBuilder::auto_flush`),
/// written bytes become visible to the reader only after
/// [`flush()`](`BytePipe::flush`).
///
/// # Examples
///
/// ```no_run
/// use bytepipe::BytePipe;
///
/// # async fn example() -> Result<(), bytepipe::Error> {
/// let pipe = BytePipe::new(true);
///
/// let writer = pipe.clone();
/// tokio::spawn(async move {
///     writer.write_u32(0x01020304).await?;
///     writer.write_fully(b"payload").await?;
///     writer.close();
///     Ok::<_, bytepipe::Error>(())
/// });
///
/// assert_eq!(pipe.read_u32().await?, 0x01020304);
/// let mut buf = [0u8; 7];
/// pipe.read_fully(&mut buf).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BytePipe {
    inner: Arc<Inner>,
}

/// Write lease guard: releases the lease and retries any deferred release or
/// termination on drop, including when the holder unwinds.
pub(crate) struct WriteLease<'a> {
    pipe: &'a BytePipe,
    pub(crate) backing: &'a Backing,
}

impl Drop for WriteLease<'_> {
    fn drop(&mut self) {
        self.pipe.inner.state.end_write();
        self.pipe.after_lease_release();
    }
}

/// Read lease guard, symmetric to [`WriteLease`].
pub(crate) struct ReadLease<'a> {
    pipe: &'a BytePipe,
    pub(crate) backing: &'a Backing,
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        self.pipe.inner.state.end_read();
        self.pipe.after_lease_release();
    }
}

impl BytePipe {
    /// Creates a pipe with the default capacity and pool.
    pub fn new(auto_flush: bool) -> Self {
        pipe().auto_flush(auto_flush).build()
    }

    /// Creates a closed pipe preloaded with `content`, for feeding a fixed
    /// byte sequence to a consumer. `content` must fit the default capacity.
    pub fn from_slice(content: &[u8]) -> Self {
        let p = pipe().content(content).build();
        p.close();
        p
    }

    // ---- introspection

    /// Bytes currently available to the reader.
    pub fn available_for_read(&self) -> usize {
        self.inner.capacity.available_for_read()
    }

    /// Free space currently available to the writer. A pipe holding no ring
    /// (nothing leased yet, or an already drained and recycled ring) reports
    /// the full capacity while open: the next write leases a fresh ring.
    pub fn available_for_write(&self) -> usize {
        if self.is_closed_for_write() {
            return 0;
        }
        match self.inner.state.tag() {
            Tag::IdleEmpty => self.inner.capacity.total(),
            _ => self.inner.capacity.available_for_write(),
        }
    }

    /// Total bytes consumed over the pipe's lifetime.
    pub fn total_bytes_read(&self) -> u64 {
        self.inner.total_read.load(Ordering::Acquire)
    }

    /// Total bytes produced over the pipe's lifetime.
    pub fn total_bytes_written(&self) -> u64 {
        self.inner.total_written.load(Ordering::Acquire)
    }

    /// Whether every write is implicitly flushed.
    pub fn auto_flush(&self) -> bool {
        self.inner.auto_flush
    }

    /// Whether reads can no longer yield bytes: the pipe was closed and the
    /// ring is drained, or it was closed abortively.
    pub fn is_closed_for_read(&self) -> bool {
        match self.inner.closed.get() {
            Some(closed) => {
                closed.cause.is_some()
                    || (self.inner.capacity.available_for_read() == 0
                        && self.inner.capacity.pending_to_flush() == 0)
            }
            None => self.inner.state.tag() == Tag::Terminated,
        }
    }

    /// Whether the write side was closed.
    pub fn is_closed_for_write(&self) -> bool {
        self.inner.closed.get().is_some()
    }

    /// The cause recorded by an abortive close, if any.
    pub fn closed_cause(&self) -> Option<Error> {
        self.inner.closed.get().and_then(|c| c.cause.clone())
    }

    // ---- flush / close / cancel

    /// Promotes all pending writes to readable and wakes whichever side can
    /// now make progress. When this pipe is joined, the delegate is flushed
    /// first.
    pub fn flush(&self) {
        if let Some(join) = self.inner.joining.get() {
            join.dst().flush();
        }
        self.inner.capacity.flush();
        if self.inner.capacity.available_for_read() > 0 {
            self.inner.read_slot.notify();
        }
        if self.inner.capacity.available_for_write() > 0 {
            self.inner.write_slot.notify();
        }
    }

    /// Closes the pipe cleanly: the reader drains what was written, then
    /// reaches end-of-stream; further writes fail with [`Error::Closed`].
    ///
    /// Returns whether this call closed the pipe (the first close wins).
    pub fn close(&self) -> bool {
        self.close_inner(None)
    }

    /// Closes the pipe abortively with a cause. Both sides observe the cause
    /// and buffered bytes may be lost.
    pub fn fail<E>(&self, cause: E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let cause: Cause = Arc::new(cause);
        self.close_inner(Some(Error::Faulted(cause)))
    }

    /// Cancels the pipe: an abortive close with [`Error::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.close_inner(Some(Error::Cancelled))
    }

    fn close_inner(&self, cause: Option<Error>) -> bool {
        let has_cause = cause.is_some();
        // Flush on both sides of the marker so nothing stays pending.
        self.inner.capacity.flush();
        if self.inner.closed.set(Closed { cause }).is_err() {
            return false;
        }
        self.inner.capacity.flush();

        if has_cause
            || self.inner.capacity.is_empty()
            || self.inner.state.tag() == Tag::IdleEmpty
        {
            self.try_terminate();
        }

        self.inner.read_slot.notify();
        self.inner.write_slot.notify();
        self.inner.closed_event.notify(usize::MAX.additional().relaxed());

        // A join whose source already terminated propagates on close instead
        // of at completion.
        if let Some(join) = self.inner.joining.get() {
            if join.completed() {
                self.propagate_close(join);
            }
        }

        if has_cause {
            if let Some(token) = self.inner.token.get() {
                token.cancel();
            }
        }
        true
    }

    /// Ties the pipe's lifetime to a cancellation token: when the token is
    /// cancelled the pipe is cancelled, and when the pipe is closed with a
    /// cause the token is cancelled. Must be called within a tokio runtime.
    ///
    /// Only the first attached token is tracked.
    pub fn attach_token(&self, token: CancellationToken) {
        if self.inner.token.set(token.clone()).is_err() {
            return;
        }
        let pipe = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    pipe.cancel();
                }
                _ = pipe.closed_signal() => {}
            }
        });
    }

    async fn closed_signal(&self) {
        loop {
            if self.inner.closed.get().is_some() {
                return;
            }
            let listener = self.inner.closed_event.listen();
            if self.inner.closed.get().is_some() {
                return;
            }
            listener.await;
        }
    }

    /// Sets the byte order of the primitive operations.
    ///
    /// The wire order is fixed big-endian; the call forwards to the join
    /// delegate (matching historical behaviour) and is otherwise a no-op.
    /// Callers needing little-endian reverse bytes themselves.
    #[deprecated(note = "the wire order is fixed big-endian; reverse bytes at the call site")]
    pub fn set_byte_order(&self, order: ByteOrder) {
        if let Some(join) = self.inner.joining.get() {
            #[allow(deprecated)]
            join.dst().set_byte_order(order);
        }
    }

    // ---- lease protocol

    /// Acquires the write lease, leasing a backing store from the pool on the
    /// first write.
    pub(crate) fn write_lease(&self) -> Result<WriteLease<'_>, Error> {
        if let Some(closed) = self.inner.closed.get() {
            return Err(closed.write_error());
        }
        let inner = &self.inner;
        match inner.state.setup_write(|| {
            inner.capacity.reset_for_write();
            Backing::new(inner.pool.borrow(), inner.capacity.total())
        }) {
            Ok(backing) => Ok(WriteLease { pipe: self, backing }),
            Err(SetupError::Busy) => Err(Error::Busy),
            Err(SetupError::Terminated) => {
                Err(self.inner.closed.get().map(Closed::write_error).unwrap_or(Error::Closed))
            }
        }
    }

    /// Acquires the read lease. `Ok(None)` means nothing is leased (empty or
    /// terminated channel); a recorded cause surfaces before that.
    pub(crate) fn read_lease(&self) -> Result<Option<ReadLease<'_>>, Error> {
        match self.inner.state.setup_read() {
            Ok(Some(backing)) => Ok(Some(ReadLease { pipe: self, backing })),
            Ok(None) => {
                if let Some(closed) = self.inner.closed.get() {
                    if let Some(cause) = &closed.cause {
                        return Err(cause.clone());
                    }
                }
                Ok(None)
            }
            Err(_) => Err(Error::Busy),
        }
    }

    /// Completes a write reservation: account the bytes, then flush when
    /// configured to — or when the ring just became full, so a producer never
    /// deadlocks on bytes only it can see.
    pub(crate) fn bytes_written(&self, n: usize) {
        self.inner.capacity.complete_write(n);
        self.inner.total_written.fetch_add(n as u64, Ordering::AcqRel);
        if self.inner.auto_flush || self.inner.capacity.is_full() {
            self.flush();
        }
    }

    /// Completes a read reservation: account the bytes, hand the space back
    /// and wake a starved writer.
    pub(crate) fn bytes_read(&self, n: usize) {
        self.inner.capacity.complete_read(n);
        self.inner.total_read.fetch_add(n as u64, Ordering::AcqRel);
        self.inner.write_slot.notify();
    }

    /// Runs after every lease release: recycles a fully drained ring and
    /// completes a termination that was deferred by the active lease.
    fn after_lease_release(&self) {
        if self.inner.closed.get().is_some() || self.inner.joining.get().is_some() {
            self.try_terminate();
            return;
        }
        if self.inner.state.tag() == Tag::IdleNonEmpty && self.inner.capacity.try_lock_for_release() {
            match self.inner.state.release_idle() {
                Some(backing) => self.inner.pool.recycle(backing.into_storage()),
                None => {
                    // Lost the slot to a fresh lease between the lock and the
                    // release; re-arm the counters and wake the lease holder.
                    self.inner.capacity.reset_for_write();
                    self.inner.write_slot.notify();
                }
            }
        }
    }

    /// Attempts the absorbing transition: requires a close or a join, a
    /// drained (or force-discarded) ring and no active lease. Safe to call
    /// repeatedly; the release paths retry it until it lands.
    pub(crate) fn try_terminate(&self) -> bool {
        let closed = self.inner.closed.get();
        let joining = self.inner.joining.get();
        if closed.is_none() && joining.is_none() {
            return false;
        }
        let forced = closed.is_some_and(|c| c.cause.is_some());

        if forced {
            self.inner.capacity.force_lock_for_release();
        } else {
            let drained = self.inner.capacity.try_lock_for_release() || self.inner.capacity.is_locked();
            if !drained && self.inner.state.tag() != Tag::IdleEmpty {
                return false;
            }
        }

        match self.inner.state.terminate() {
            Terminate::Done(backing) => {
                if let Some(backing) = backing {
                    self.inner.pool.recycle(backing.into_storage());
                }
                self.inner.read_slot.notify();
                self.inner.write_slot.notify();
                if let Some(join) = joining {
                    self.complete_join(join);
                }
                true
            }
            Terminate::Active => false,
        }
    }

    /// Follows the join chain to the pipe that currently receives writes:
    /// every joined *and terminated* node delegates to its destination.
    pub(crate) fn effective(&self) -> BytePipe {
        let mut node = self.clone();
        loop {
            let next = match node.inner.joining.get() {
                Some(join) if node.inner.state.tag() == Tag::Terminated => join.dst().clone(),
                _ => return node,
            };
            node = next;
        }
    }

    pub(crate) fn same_channel(&self, other: &BytePipe) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether a failed write on this pipe means "terminated into a join":
    /// the caller should resolve the delegation chain and retry there rather
    /// than surface the error.
    pub(crate) fn should_reroute(&self, err: &Error) -> bool {
        matches!(err, Error::Closed)
            && self.inner.closed.get().is_none()
            && self.inner.joining.get().is_some()
    }

    // ---- suspension

    /// Parks the reader until at least `min` bytes are readable. `Ok(false)`
    /// means the pipe reached end-of-stream with fewer than `min` remaining.
    pub(crate) async fn read_suspend(&self, min: usize) -> Result<bool, Error> {
        assert!(min <= self.inner.capacity.total(), "minimum exceeds the ring capacity");
        loop {
            if self.inner.capacity.available_for_read() >= min {
                return Ok(true);
            }
            if let Some(closed) = self.inner.closed.get() {
                if let Some(cause) = &closed.cause {
                    return Err(cause.clone());
                }
                // Close flushed everything; whatever is readable now is all
                // there will ever be.
                return Ok(self.inner.capacity.available_for_read() >= min);
            }
            if self.inner.state.tag() == Tag::Terminated {
                return Ok(false);
            }
            self.inner.read_slot.wait().await?;
        }
    }

    /// Parks the writer until at least `min` bytes of space are free. Also
    /// returns when the pipe terminated into a join, so the caller re-routes.
    pub(crate) async fn write_suspend(&self, min: usize) -> Result<(), Error> {
        assert!(min <= self.inner.capacity.total(), "minimum exceeds the ring capacity");
        loop {
            if let Some(closed) = self.inner.closed.get() {
                return Err(closed.write_error());
            }
            match self.inner.state.tag() {
                // Terminated into a join: the caller re-routes.
                Tag::Terminated => return Ok(()),
                // No ring leased; the next write lease re-arms the counters.
                Tag::IdleEmpty => return Ok(()),
                _ => {}
            }
            if self.inner.capacity.available_for_write() >= min {
                return Ok(());
            }
            // Make everything produced so far visible before parking, so the
            // reader can create the space this writer is waiting for.
            self.flush();
            self.inner.write_slot.wait().await?;
        }
    }
}

impl std::fmt::Debug for BytePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytePipe")
            .field("state", &self.inner.state.tag())
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.inner.closed.get().is_some())
            .field("joined", &self.inner.joining.get().is_some())
            .finish()
    }
}

/// Starts building a pipe.
pub fn pipe() -> PipeBuilder {
    PipeBuilder {
        auto_flush: false,
        capacity: DEFAULT_CAPACITY,
        reserved: DEFAULT_RESERVED,
        pool: None,
        content: Vec::new(),
    }
}

/// Builder for a [`BytePipe`].
pub struct PipeBuilder {
    auto_flush: bool,
    capacity: usize,
    reserved: usize,
    pool: Option<Arc<BufferPool>>,
    content: Vec<u8>,
}

impl PipeBuilder {
    /// Flush implicitly after every write. Without this, written bytes stay
    /// invisible to the reader until an explicit [`flush()`](`BytePipe::flush`).
    #[must_use]
    pub fn auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    /// Logical ring capacity in bytes (default 4088, at most `u16::MAX`).
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Reserved wrap tail in bytes (default 8; at least the largest
    /// primitive).
    #[must_use]
    pub fn reserved(mut self, reserved: usize) -> Self {
        self.reserved = reserved;
        self
    }

    /// Pool the backing store is leased from and recycled to. Its segment
    /// size must equal `capacity + reserved`.
    #[must_use]
    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Preloads the pipe with readable content (at most `capacity` bytes).
    #[must_use]
    pub fn content(mut self, content: &[u8]) -> Self {
        self.content = content.to_vec();
        self
    }

    pub fn build(self) -> BytePipe {
        assert!(
            self.reserved >= DEFAULT_RESERVED,
            "reserved tail must fit the largest primitive"
        );
        let capacity = RingCapacity::new(self.capacity);
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(BufferPool::new(self.capacity + self.reserved)));
        assert_eq!(
            pool.segment(),
            self.capacity + self.reserved,
            "pool segment must equal capacity + reserved"
        );

        let state = if self.content.is_empty() {
            ChannelState::new()
        } else {
            assert!(self.content.len() <= self.capacity, "preloaded content exceeds capacity");
            let backing = Backing::new(pool.borrow(), self.capacity);
            // SAFETY: the backing is not shared yet.
            unsafe { backing.write_slice(0, self.content.len()) }.copy_from_slice(&self.content);
            backing.advance_write(self.content.len());
            capacity.reset_for_read(self.content.len());
            ChannelState::preloaded(backing)
        };

        BytePipe {
            inner: Arc::new(Inner {
                state,
                capacity,
                closed: OnceLock::new(),
                joining: OnceLock::new(),
                read_slot: WaitSlot::new(),
                write_slot: WaitSlot::new(),
                closed_event: Event::new(),
                total_read: AtomicU64::new(0),
                total_written: AtomicU64::new(0),
                auto_flush: self.auto_flush,
                pool,
                token: OnceLock::new(),
            }),
        }
    }
}
