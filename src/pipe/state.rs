use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::ring::Backing;

/// Channel state tag. `Releasing` is a transient micro-state covering the
/// instant between un-publishing the tag and emptying the backing slot, so
/// that no other transition can observe a half-released slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Tag {
    IdleEmpty = 0,
    IdleNonEmpty = 1,
    Writing = 2,
    Reading = 3,
    ReadingWriting = 4,
    Releasing = 5,
    Terminated = 6,
}

impl Tag {
    fn decode(v: u8) -> Self {
        match v {
            0 => Tag::IdleEmpty,
            1 => Tag::IdleNonEmpty,
            2 => Tag::Writing,
            3 => Tag::Reading,
            4 => Tag::ReadingWriting,
            5 => Tag::Releasing,
            _ => Tag::Terminated,
        }
    }
}

/// Failure modes of a lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetupError {
    /// The same side already holds a lease (concurrent reader or writer).
    Busy,
    /// The channel is terminated.
    Terminated,
}

/// Outcome of a termination attempt.
pub(crate) enum Terminate {
    /// The channel is (now) terminated; the backing, if one was still
    /// leased to the channel, is handed back for recycling.
    Done(Option<Backing>),
    /// A lease is active; the releasing side retries termination.
    Active,
}

/// The channel state machine: a tag cell plus the slot holding the leased
/// backing store. Every transition is a CAS on the tag.
///
/// Slot discipline (this is what makes the `UnsafeCell` sound):
/// - the slot is written only on the `IdleEmpty -> Writing` lease, and only
///   the single producer task takes that path;
/// - the slot is emptied only behind the transient `Releasing` tag, entered
///   exclusively by CAS from a lease-free state;
/// - every other access is a shared read performed after winning a CAS into
///   a lease state, ordered after the install by the Release/Acquire pair on
///   the tag.
pub(crate) struct ChannelState {
    tag: AtomicU8,
    slot: UnsafeCell<Option<Backing>>,
}

// SAFETY: slot access follows the discipline documented on the struct;
// Backing itself is Send + Sync.
unsafe impl Send for ChannelState {}
unsafe impl Sync for ChannelState {}

impl ChannelState {
    pub(crate) fn new() -> Self {
        Self {
            tag: AtomicU8::new(Tag::IdleEmpty as u8),
            slot: UnsafeCell::new(None),
        }
    }

    /// Starts out `IdleNonEmpty` with `backing` already leased (preloaded
    /// content).
    pub(crate) fn preloaded(backing: Backing) -> Self {
        Self {
            tag: AtomicU8::new(Tag::IdleNonEmpty as u8),
            slot: UnsafeCell::new(Some(backing)),
        }
    }

    pub(crate) fn tag(&self) -> Tag {
        Tag::decode(self.tag.load(Ordering::Acquire))
    }

    fn cas(&self, from: Tag, to: Tag) -> bool {
        self.tag
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// # Safety
    ///
    /// Caller must hold a lease (it won a CAS into `Writing`, `Reading` or
    /// `ReadingWriting`), which guarantees the slot is populated and stays so
    /// until the lease ends.
    pub(crate) unsafe fn leased(&self) -> &Backing {
        // SAFETY: see above; the slot is only emptied from lease-free states.
        unsafe { (*self.slot.get()).as_ref().unwrap_unchecked() }
    }

    /// Acquires the write lease, leasing a fresh backing store via `lease`
    /// when the channel holds none. `lease` may run more than once when the
    /// install loses a race to a concurrent close and the loop retries.
    pub(crate) fn setup_write(&self, mut lease: impl FnMut() -> Backing) -> Result<&Backing, SetupError> {
        loop {
            match self.tag() {
                Tag::IdleEmpty => {
                    // Install before publish; only the single producer ever
                    // reaches this arm, so the empty slot is ours to fill.
                    unsafe { *self.slot.get() = Some(lease()) };
                    if self.cas(Tag::IdleEmpty, Tag::Writing) {
                        return Ok(unsafe { self.leased() });
                    }
                    // Lost the tag to a concurrent close. The region is
                    // dropped rather than recycled; the race is one-shot.
                    unsafe { *self.slot.get() = None };
                }
                Tag::IdleNonEmpty => {
                    if self.cas(Tag::IdleNonEmpty, Tag::Writing) {
                        return Ok(unsafe { self.leased() });
                    }
                }
                Tag::Reading => {
                    if self.cas(Tag::Reading, Tag::ReadingWriting) {
                        return Ok(unsafe { self.leased() });
                    }
                }
                Tag::Writing | Tag::ReadingWriting => return Err(SetupError::Busy),
                Tag::Releasing => std::hint::spin_loop(),
                Tag::Terminated => return Err(SetupError::Terminated),
            }
        }
    }

    /// Acquires the read lease. `Ok(None)` means there is nothing leased to
    /// read from (empty or terminated channel).
    pub(crate) fn setup_read(&self) -> Result<Option<&Backing>, SetupError> {
        loop {
            match self.tag() {
                Tag::IdleEmpty | Tag::Terminated => return Ok(None),
                Tag::IdleNonEmpty => {
                    if self.cas(Tag::IdleNonEmpty, Tag::Reading) {
                        return Ok(Some(unsafe { self.leased() }));
                    }
                }
                Tag::Writing => {
                    if self.cas(Tag::Writing, Tag::ReadingWriting) {
                        return Ok(Some(unsafe { self.leased() }));
                    }
                }
                Tag::Reading | Tag::ReadingWriting => return Err(SetupError::Busy),
                Tag::Releasing => std::hint::spin_loop(),
            }
        }
    }

    /// Releases the write lease.
    pub(crate) fn end_write(&self) {
        loop {
            match self.tag() {
                Tag::Writing => {
                    if self.cas(Tag::Writing, Tag::IdleNonEmpty) {
                        return;
                    }
                }
                Tag::ReadingWriting => {
                    if self.cas(Tag::ReadingWriting, Tag::Reading) {
                        return;
                    }
                }
                other => {
                    debug_assert!(false, "write lease released from {other:?}");
                    return;
                }
            }
        }
    }

    /// Releases the read lease.
    pub(crate) fn end_read(&self) {
        loop {
            match self.tag() {
                Tag::Reading => {
                    if self.cas(Tag::Reading, Tag::IdleNonEmpty) {
                        return;
                    }
                }
                Tag::ReadingWriting => {
                    if self.cas(Tag::ReadingWriting, Tag::Writing) {
                        return;
                    }
                }
                other => {
                    debug_assert!(false, "read lease released from {other:?}");
                    return;
                }
            }
        }
    }

    /// `IdleNonEmpty -> IdleEmpty`, handing the backing back for recycling.
    /// Returns `None` when the channel is not idle-non-empty (someone else
    /// claimed it first).
    pub(crate) fn release_idle(&self) -> Option<Backing> {
        if !self.cas(Tag::IdleNonEmpty, Tag::Releasing) {
            return None;
        }
        // SAFETY: Releasing grants exclusive slot access.
        let backing = unsafe { (*self.slot.get()).take() };
        self.tag.store(Tag::IdleEmpty as u8, Ordering::Release);
        backing
    }

    /// Absorbing transition into `Terminated`; only possible from lease-free
    /// states. Idempotent once terminated.
    pub(crate) fn terminate(&self) -> Terminate {
        loop {
            match self.tag() {
                Tag::IdleEmpty => {
                    if self.cas(Tag::IdleEmpty, Tag::Terminated) {
                        return Terminate::Done(None);
                    }
                }
                Tag::IdleNonEmpty => {
                    if self.cas(Tag::IdleNonEmpty, Tag::Releasing) {
                        // SAFETY: Releasing grants exclusive slot access.
                        let backing = unsafe { (*self.slot.get()).take() };
                        self.tag.store(Tag::Terminated as u8, Ordering::Release);
                        return Terminate::Done(backing);
                    }
                }
                Tag::Terminated => return Terminate::Done(None),
                Tag::Releasing => std::hint::spin_loop(),
                Tag::Writing | Tag::Reading | Tag::ReadingWriting => return Terminate::Active,
            }
        }
    }

    /// Takes the backing out with exclusive access, for the final drop.
    pub(crate) fn take_backing(&mut self) -> Option<Backing> {
        self.slot.get_mut().take()
    }
}
