//! Multi-step zero-copy write sessions.

use crate::error::Error;

use super::{BytePipe, state::SetupError, state::Tag};

/// A multi-step zero-copy write session.
///
/// Where [`write_with`](`BytePipe::write_with`) is one visit, a session lets
/// the producer interleave view requests, commits and suspensions across an
/// arbitrary number of steps while reusing the same lease:
///
/// ```no_run
/// # async fn example(pipe: &bytepipe::BytePipe) -> Result<(), bytepipe::Error> {
/// let mut session = pipe.write_session();
/// session.await_free_space(128).await?;
/// if let Some(view) = session.request(128)? {
///     view[..3].copy_from_slice(b"abc");
///     session.written(3);
/// }
/// session.flush();
/// # Ok(())
/// # }
/// ```
///
/// Dropping the session releases any outstanding request and flushes, so a
/// producer that bails out early cannot strand reserved space.
pub struct WriteSession {
    target: BytePipe,
    reserved: usize,
    visible: usize,
    leased: bool,
}

impl BytePipe {
    /// Opens a write session. The session binds to the current join
    /// delegation target and re-resolves it on every suspension.
    pub fn write_session(&self) -> WriteSession {
        WriteSession {
            target: self.effective(),
            reserved: 0,
            visible: 0,
            leased: false,
        }
    }
}

impl WriteSession {
    /// Suspends until at least `min` bytes of space are free, releasing any
    /// outstanding request first.
    pub async fn await_free_space(&mut self, min: usize) -> Result<(), Error> {
        self.end_request();
        self.target.write_suspend(min).await?;
        if self.target.inner.state.tag() == Tag::Terminated {
            self.target = self.target.effective();
        }
        Ok(())
    }

    /// Requests a writable view of at least `min` bytes without suspending.
    /// Returns `None` when that much space is not currently free. A previous
    /// uncommitted request is released first.
    ///
    /// The view stays valid until [`written`](`WriteSession::written`) or the
    /// next request; commit what was filled with `written`.
    pub fn request(&mut self, min: usize) -> Result<Option<&mut [u8]>, Error> {
        assert!(min >= 1, "min must be at least one byte");
        self.end_request();

        loop {
            if let Some(cause) = self.target.closed_cause() {
                return Err(cause);
            }
            if self.target.is_closed_for_write() {
                return Err(Error::Closed);
            }

            let acquired = self
                .target
                .inner
                .state
                .setup_write(|| {
                    self.target.inner.capacity.reset_for_write();
                    crate::ring::Backing::new(
                        self.target.inner.pool.borrow(),
                        self.target.inner.capacity.total(),
                    )
                })
                .map(|_| ());
            match acquired {
                Ok(()) => break,
                Err(SetupError::Busy) => return Err(Error::Busy),
                Err(SetupError::Terminated) => {
                    // Terminated into a join while the session was idle.
                    if self.target.inner.joining.get().is_some() {
                        self.target = self.target.effective();
                        continue;
                    }
                    return Err(Error::Closed);
                }
            }
        }
        self.leased = true;

        let locked = self.target.inner.capacity.try_write_at_least(min);
        if locked == 0 {
            self.end_request();
            return Ok(None);
        }

        // SAFETY: the lease was just acquired and is held by this session.
        let backing = unsafe { self.target.inner.state.leased() };
        let pos = backing.write_position();
        let contiguous = backing.contiguous(pos);
        let visible = if locked <= contiguous {
            locked
        } else if contiguous >= min {
            contiguous
        } else {
            min.min(contiguous + backing.reserved())
        };

        self.reserved = locked;
        self.visible = visible;
        // SAFETY: `visible` bytes at `pos` are covered by the reservation and
        // the returned borrow keeps the session (and thus the lease) pinned.
        Ok(Some(unsafe { backing.write_slice(pos, visible) }))
    }

    /// Commits `n` bytes of the most recent request and returns the unused
    /// remainder of the reservation.
    ///
    /// # Panics
    ///
    /// Panics when `n` exceeds the requested view.
    pub fn written(&mut self, n: usize) {
        if !self.leased {
            assert!(n == 0, "no outstanding request");
            return;
        }
        assert!(n <= self.visible, "committed more bytes than requested");
        // SAFETY: the session holds the lease between request and commit.
        let backing = unsafe { self.target.inner.state.leased() };
        let pos = backing.write_position();
        let contiguous = backing.contiguous(pos);
        if n > contiguous {
            backing.carry(n - contiguous);
        }
        backing.advance_write(n);
        self.target.bytes_written(n);
        self.target.inner.capacity.complete_read(self.reserved - n);
        self.reserved = 0;
        self.visible = 0;
        self.release_lease();
    }

    /// Flushes the pipe the session writes into.
    pub fn flush(&self) {
        self.target.flush();
    }

    fn end_request(&mut self) {
        if self.reserved > 0 {
            self.target.inner.capacity.complete_read(self.reserved);
            self.reserved = 0;
            self.visible = 0;
        }
        self.release_lease();
    }

    fn release_lease(&mut self) {
        if self.leased {
            self.leased = false;
            self.target.inner.state.end_write();
            self.target.after_lease_release();
        }
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        self.end_request();
        self.target.flush();
    }
}
