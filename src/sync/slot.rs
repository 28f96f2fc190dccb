use std::sync::atomic::{AtomicU8, Ordering};

use event_listener::{Event, IntoNotification};

use crate::error::Error;

/// No wakeup pending, nobody parked.
const UNSET: u8 = 0;
/// A wakeup is pending (notification arrived before or during a wait).
const WAKE: u8 = 1 << 0;
/// A task is currently parked on this slot.
const BUSY: u8 = 1 << 1;

/// A single-cell suspension slot holding at most one parked task.
///
/// The pipe has two of these, one per side. Parking follows the
/// check-listen-recheck protocol so a wakeup racing with the park is never
/// lost; a second task attempting to park while the slot is occupied fails
/// with [`Error::Busy`]. Wakeups are permitted to be spurious, so callers
/// always loop over their predicate around [`wait()`](`WaitSlot::wait`).
pub(crate) struct WaitSlot {
    event: Event,
    flag: AtomicU8,
}

/// Clears BUSY when the waiter leaves the slot, including when the waiting
/// future is dropped mid-park.
struct BusyGuard<'a>(&'a WaitSlot);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.flag.fetch_and(!BUSY, Ordering::AcqRel);
    }
}

impl WaitSlot {
    pub(crate) fn new() -> Self {
        Self {
            event: Event::new(),
            flag: AtomicU8::new(UNSET),
        }
    }

    /// Checks and atomically consumes a pending wakeup.
    fn take_wake(&self) -> bool {
        self.flag.fetch_and(!WAKE, Ordering::AcqRel) & WAKE != 0
    }

    /// Parks until the next [`notify()`](`WaitSlot::notify`).
    ///
    /// Returns immediately when a wakeup is already pending. Fails with
    /// [`Error::Busy`] when another task is parked here, which is how a
    /// second concurrent reader (or writer) on the pipe is detected.
    pub(crate) async fn wait(&self) -> Result<(), Error> {
        if self.flag.fetch_or(BUSY, Ordering::AcqRel) & BUSY != 0 {
            return Err(Error::Busy);
        }
        let _busy = BusyGuard(self);

        loop {
            if self.take_wake() {
                return Ok(());
            }

            let listener = self.event.listen();

            // Recheck after installing the listener: a notify that landed in
            // between set the flag and may not have seen the listener.
            if self.take_wake() {
                return Ok(());
            }

            listener.await;
        }
    }

    /// Wakes the parked task, if any; otherwise leaves a pending wakeup.
    pub(crate) fn notify(&self) {
        self.flag.fetch_or(WAKE, Ordering::AcqRel);
        self.event.notify(1.additional().relaxed());
    }
}
