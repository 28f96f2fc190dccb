use std::{
    mem::ManuallyDrop,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

/// The backing byte region of a pipe: `capacity` logical bytes plus a
/// reserved tail used to linearise primitives that straddle the wrap.
///
/// The region is shared between the producer and the consumer, which operate
/// on strictly disjoint ranges governed by the capacity counters: a slice is
/// only handed out against a reservation, and no reservation ever covers the
/// same byte on both sides. Each cursor is owned by one side; the atomics are
/// there for the cross-thread hand-off of the cursor value when a side is
/// resumed on another worker thread, not for mutual exclusion.
pub(crate) struct Backing {
    ptr: *mut u8,
    total: usize,
    capacity: usize,
    read_pos: CachePadded<AtomicUsize>,
    write_pos: CachePadded<AtomicUsize>,
}

// SAFETY: the raw region is only ever accessed through reservation-backed
// slices on disjoint ranges (see the struct docs); the cursors are atomics.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    /// Wraps a pool region of `capacity + reserved` bytes.
    pub(crate) fn new(storage: Box<[u8]>, capacity: usize) -> Self {
        assert!(storage.len() > capacity, "storage must include the reserved tail");
        let total = storage.len();
        let ptr = Box::into_raw(storage) as *mut u8;
        Self {
            ptr,
            total,
            capacity,
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            write_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Recovers the raw region for recycling into the pool.
    pub(crate) fn into_storage(self) -> Box<[u8]> {
        let this = ManuallyDrop::new(self);
        // SAFETY: ptr/total come from Box::into_raw in new(); ManuallyDrop
        // prevents the Drop impl from freeing the region a second time.
        unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(this.ptr, this.total)) }
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the reserved wrap tail.
    pub(crate) const fn reserved(&self) -> usize {
        self.total - self.capacity
    }

    pub(crate) fn read_position(&self) -> usize {
        self.read_pos.load(Ordering::Acquire)
    }

    pub(crate) fn write_position(&self) -> usize {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Advances the read cursor by `n`, wrapping at the logical capacity.
    pub(crate) fn advance_read(&self, n: usize) {
        let pos = (self.read_position() + n) % self.capacity;
        self.read_pos.store(pos, Ordering::Release);
    }

    /// Advances the write cursor by `n`, wrapping at the logical capacity.
    pub(crate) fn advance_write(&self, n: usize) {
        let pos = (self.write_position() + n) % self.capacity;
        self.write_pos.store(pos, Ordering::Release);
    }

    /// Contiguous bytes from `pos` to the logical end of the ring.
    pub(crate) const fn contiguous(&self, pos: usize) -> usize {
        self.capacity - pos
    }

    /// Shared view of `len` bytes starting at `pos`.
    ///
    /// # Safety
    ///
    /// The caller must hold a read reservation covering `pos..pos + len`
    /// (after `roll_bytes` for a range extending into the reserved tail).
    pub(crate) unsafe fn read_slice(&self, pos: usize, len: usize) -> &[u8] {
        debug_assert!(pos + len <= self.total);
        unsafe { std::slice::from_raw_parts(self.ptr.add(pos), len) }
    }

    /// Mutable view of `len` bytes starting at `pos`.
    ///
    /// # Safety
    ///
    /// The caller must hold a write reservation covering `pos..pos + len`
    /// (the range may extend into the reserved tail; follow up with `carry`).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn write_slice(&self, pos: usize, len: usize) -> &mut [u8] {
        debug_assert!(pos + len <= self.total);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(pos), len) }
    }

    /// Copies `overrun` bytes written past the logical end (into the reserved
    /// tail) back to the start of the region, completing a wrapped write.
    pub(crate) fn carry(&self, overrun: usize) {
        debug_assert!(overrun <= self.total - self.capacity);
        // SAFETY: source is the reserved tail, destination the region head;
        // overrun <= reserved < capacity so the ranges cannot overlap. The
        // head bytes belong to the writer's reservation (they are the wrapped
        // part of it), so no reader view covers them.
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(self.capacity), self.ptr, overrun) };
    }

    /// Copies the first `n` bytes of the region into the reserved tail so a
    /// primitive straddling the wrap can be read linearly past the end.
    pub(crate) fn roll_bytes(&self, n: usize) {
        debug_assert!(n <= self.total - self.capacity);
        // SAFETY: the head bytes belong to the reader's reservation (the
        // wrapped part of it) and the tail is unused by the writer while the
        // reader's range covers the wrap boundary, since at most one
        // reservation can span it at a time.
        unsafe { ptr::copy_nonoverlapping(self.ptr, self.ptr.add(self.capacity), n) };
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // SAFETY: ptr/total come from Box::into_raw in new().
        unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.total))) };
    }
}
