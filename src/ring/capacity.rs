use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

// Counter layout inside the packed word. Each counter gets 16 bits, which
// bounds the ring capacity at u16::MAX bytes; the release lock lives above
// them.
const MASK: u64 = 0xFFFF;
const READ: u32 = 0;
const WRITE: u32 = 16;
const PENDING: u32 = 32;
const LOCKED: u64 = 1 << 48;

/// Snapshot of the packed counter word.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters(u64);

impl Counters {
    const fn get(self, shift: u32) -> usize {
        ((self.0 >> shift) & MASK) as usize
    }

    #[must_use]
    const fn add(self, shift: u32, n: usize) -> Self {
        Self(self.0 + ((n as u64) << shift))
    }

    #[must_use]
    const fn sub(self, shift: u32, n: usize) -> Self {
        Self(self.0 - ((n as u64) << shift))
    }

    const fn locked(self) -> bool {
        self.0 & LOCKED != 0
    }
}

/// Atomic occupancy accounting for the ring.
///
/// Three counters are packed into a single `AtomicU64` so that every
/// reservation and completion is one linearizable CAS:
///
/// - `available_for_read`: flushed bytes a reader may reserve,
/// - `available_for_write`: free space a writer may reserve,
/// - `pending_to_flush`: written bytes not yet visible to the reader.
///
/// At rest (no reservation mid-flight) the three always sum to the total
/// capacity. A `try_*` operation reserves; the caller must follow up with the
/// matching `complete_*` for the amount actually moved. `flush` promotes
/// pending bytes to readable. The lock bit permanently poisons the word so
/// the terminator can evict the backing store: once locked, every `try_*`
/// fails and the counters read as zero until the next `reset_for_*`.
pub(crate) struct RingCapacity {
    state: CachePadded<AtomicU64>,
    total: usize,
}

impl RingCapacity {
    pub(crate) fn new(total: usize) -> Self {
        assert!(total > 0 && total <= MASK as usize, "capacity out of range");
        Self {
            state: CachePadded::new(AtomicU64::new((total as u64) << WRITE)),
            total,
        }
    }

    pub(crate) const fn total(&self) -> usize {
        self.total
    }

    fn snapshot(&self) -> Counters {
        Counters(self.state.load(Ordering::Acquire))
    }

    /// CAS-retry loop over the packed word. The closure returns the new word
    /// and a result, or `None` to abandon the update.
    fn update<T>(&self, mut f: impl FnMut(Counters) -> Option<(Counters, T)>) -> Option<T> {
        let mut old = self.snapshot();
        loop {
            let (new, out) = f(old)?;
            match self
                .state
                .compare_exchange_weak(old.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(out),
                Err(current) => old = Counters(current),
            }
        }
    }

    pub(crate) fn available_for_read(&self) -> usize {
        let c = self.snapshot();
        if c.locked() { 0 } else { c.get(READ) }
    }

    pub(crate) fn available_for_write(&self) -> usize {
        let c = self.snapshot();
        if c.locked() { 0 } else { c.get(WRITE) }
    }

    pub(crate) fn pending_to_flush(&self) -> usize {
        let c = self.snapshot();
        if c.locked() { 0 } else { c.get(PENDING) }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.snapshot().locked()
    }

    /// Whether nothing is buffered, reserved or pending.
    pub(crate) fn is_empty(&self) -> bool {
        let c = self.snapshot();
        !c.locked() && c.get(WRITE) == self.total
    }

    pub(crate) fn is_full(&self) -> bool {
        let c = self.snapshot();
        !c.locked() && c.get(WRITE) == 0
    }

    /// Reserves exactly `n` bytes of free space, or nothing.
    pub(crate) fn try_write_exact(&self, n: usize) -> bool {
        self.update(|c| (!c.locked() && c.get(WRITE) >= n).then(|| (c.sub(WRITE, n), ())))
            .is_some()
    }

    /// Reserves up to `n` bytes of free space, returning the amount taken.
    pub(crate) fn try_write_at_most(&self, n: usize) -> usize {
        self.update(|c| {
            if c.locked() {
                return None;
            }
            let take = n.min(c.get(WRITE));
            (take > 0).then(|| (c.sub(WRITE, take), take))
        })
        .unwrap_or(0)
    }

    /// Reserves all free space provided at least `min` bytes are free.
    pub(crate) fn try_write_at_least(&self, min: usize) -> usize {
        self.update(|c| {
            if c.locked() {
                return None;
            }
            let avail = c.get(WRITE);
            (avail >= min && avail > 0).then(|| (c.sub(WRITE, avail), avail))
        })
        .unwrap_or(0)
    }

    /// Reserves exactly `n` readable bytes, or nothing.
    pub(crate) fn try_read_exact(&self, n: usize) -> bool {
        self.update(|c| (!c.locked() && c.get(READ) >= n).then(|| (c.sub(READ, n), ())))
            .is_some()
    }

    /// Reserves up to `n` readable bytes, returning the amount taken.
    pub(crate) fn try_read_at_most(&self, n: usize) -> usize {
        self.update(|c| {
            if c.locked() {
                return None;
            }
            let take = n.min(c.get(READ));
            (take > 0).then(|| (c.sub(READ, take), take))
        })
        .unwrap_or(0)
    }

    /// Reserves all readable bytes provided at least `min` are readable.
    pub(crate) fn try_read_at_least(&self, min: usize) -> usize {
        self.update(|c| {
            if c.locked() {
                return None;
            }
            let avail = c.get(READ);
            (avail >= min && avail > 0).then(|| (c.sub(READ, avail), avail))
        })
        .unwrap_or(0)
    }

    /// Completes a write reservation: the bytes become pending-to-flush.
    pub(crate) fn complete_write(&self, n: usize) {
        if n > 0 {
            self.state.fetch_add((n as u64) << PENDING, Ordering::AcqRel);
        }
    }

    /// Completes a read reservation: the consumed bytes become free space.
    pub(crate) fn complete_read(&self, n: usize) {
        if n > 0 {
            self.state.fetch_add((n as u64) << WRITE, Ordering::AcqRel);
        }
    }

    /// Promotes all pending bytes to readable. Returns whether any moved.
    pub(crate) fn flush(&self) -> bool {
        self.update(|c| {
            let pending = c.get(PENDING);
            (pending > 0).then(|| (c.sub(PENDING, pending).add(READ, pending), ()))
        })
        .is_some()
    }

    /// Locks the counters for buffer release.
    ///
    /// Succeeds only from the quiescent layout (no buffered bytes, no
    /// reservation, nothing pending); afterwards every `try_*` fails until a
    /// `reset_for_*` re-arms the word for a fresh backing store.
    pub(crate) fn try_lock_for_release(&self) -> bool {
        let quiescent = (self.total as u64) << WRITE;
        self.state
            .compare_exchange(quiescent, LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Locks the counters unconditionally, discarding any buffered bytes.
    /// Used by an abortive close.
    pub(crate) fn force_lock_for_release(&self) {
        self.state.swap(LOCKED, Ordering::AcqRel);
    }

    /// Re-arms the counters for a freshly leased, empty backing store.
    pub(crate) fn reset_for_write(&self) {
        self.state.store((self.total as u64) << WRITE, Ordering::Release);
    }

    /// Re-arms the counters for a backing store preloaded with `content`
    /// readable bytes.
    pub(crate) fn reset_for_read(&self, content: usize) {
        assert!(content <= self.total, "preloaded content exceeds capacity");
        let word = ((content as u64) << READ) | (((self.total - content) as u64) << WRITE);
        self.state.store(word, Ordering::Release);
    }
}

impl std::fmt::Debug for RingCapacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.snapshot();
        f.debug_struct("RingCapacity")
            .field("available_for_read", &c.get(READ))
            .field("available_for_write", &c.get(WRITE))
            .field("pending_to_flush", &c.get(PENDING))
            .field("locked", &c.locked())
            .finish()
    }
}
