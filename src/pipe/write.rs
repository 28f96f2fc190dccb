//! Writer-side operations.
//!
//! Every operation first resolves the join chain: a pipe that terminated
//! into a join forwards its producer end to the destination. The chain can
//! advance at any suspension point (or between resolution and the lease), so
//! the loops re-resolve both after parking and when a write lands on a pipe
//! that just terminated into its join.

use crate::{buffers::Packet, error::Error, ring::RingCapacity};

use super::{BytePipe, Closed, state::Tag};

/// Returns an unused write reservation to the free-space counter on drop, so
/// a panicking visitor leaves the counters as if nothing had been reserved.
struct Refund<'a> {
    capacity: &'a RingCapacity,
    amount: usize,
}

impl Drop for Refund<'_> {
    fn drop(&mut self) {
        if self.amount > 0 {
            self.capacity.complete_read(self.amount);
        }
    }
}

impl BytePipe {
    /// Writes a single byte, suspending until it fits.
    pub async fn write_u8(&self, v: u8) -> Result<(), Error> {
        self.write_primitive([v]).await
    }

    /// Writes a big-endian `u16`, suspending until it fits.
    pub async fn write_u16(&self, v: u16) -> Result<(), Error> {
        self.write_primitive(v.to_be_bytes()).await
    }

    /// Writes a big-endian `u32`, suspending until it fits.
    pub async fn write_u32(&self, v: u32) -> Result<(), Error> {
        self.write_primitive(v.to_be_bytes()).await
    }

    /// Writes a big-endian `u64`, suspending until it fits.
    pub async fn write_u64(&self, v: u64) -> Result<(), Error> {
        self.write_primitive(v.to_be_bytes()).await
    }

    /// Writes an `f32` through its big-endian bit pattern.
    pub async fn write_f32(&self, v: f32) -> Result<(), Error> {
        self.write_primitive(v.to_bits().to_be_bytes()).await
    }

    /// Writes an `f64` through its big-endian bit pattern.
    pub async fn write_f64(&self, v: f64) -> Result<(), Error> {
        self.write_primitive(v.to_bits().to_be_bytes()).await
    }

    async fn write_primitive<const N: usize>(&self, bytes: [u8; N]) -> Result<(), Error> {
        let mut target = self.effective();
        loop {
            match target.try_write_primitive(&bytes) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    target.write_suspend(N).await?;
                    target = target.effective();
                }
                Err(e) if target.should_reroute(&e) => target = target.effective(),
                Err(e) => return Err(e),
            }
        }
    }

    /// A primitive is written in place when it fits before the logical end,
    /// otherwise it spills into the reserved tail and the overrun is carried
    /// back to the start of the ring.
    fn try_write_primitive<const N: usize>(&self, bytes: &[u8; N]) -> Result<bool, Error> {
        let lease = self.write_lease()?;
        let backing = lease.backing;
        if !self.inner.capacity.try_write_exact(N) {
            return Ok(false);
        }
        let pos = backing.write_position();
        // SAFETY: N bytes are reserved; pos + N stays within the region
        // because the reserved tail fits the largest primitive.
        unsafe { backing.write_slice(pos, N) }.copy_from_slice(bytes);
        let contiguous = backing.contiguous(pos);
        if contiguous < N {
            backing.carry(N - contiguous);
        }
        backing.advance_write(N);
        self.bytes_written(N);
        Ok(true)
    }

    /// Writes all of `src`, suspending whenever the ring is full.
    pub async fn write_fully(&self, src: &[u8]) -> Result<(), Error> {
        if src.is_empty() {
            return Ok(());
        }
        let mut target = self.effective();
        let mut written = 0;
        loop {
            match target.try_write_bulk(&src[written..]) {
                Ok(n) => {
                    written += n;
                    if written >= src.len() {
                        return Ok(());
                    }
                    if n == 0 {
                        target.write_suspend(1).await?;
                        target = target.effective();
                    }
                }
                Err(e) if target.should_reroute(&e) => target = target.effective(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of `src` as currently fits, suspending only while the
    /// ring is completely full. Returns the number of bytes written.
    pub async fn write_available(&self, src: &[u8]) -> Result<usize, Error> {
        if src.is_empty() {
            return Ok(0);
        }
        let mut target = self.effective();
        loop {
            match target.try_write_bulk(src) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {
                    target.write_suspend(1).await?;
                    target = target.effective();
                }
                Err(e) if target.should_reroute(&e) => target = target.effective(),
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn try_write_bulk(&self, src: &[u8]) -> Result<usize, Error> {
        let lease = self.write_lease()?;
        let backing = lease.backing;
        let mut written = 0;
        while written < src.len() {
            let pos = backing.write_position();
            let want = (src.len() - written).min(backing.contiguous(pos));
            let part = self.inner.capacity.try_write_at_most(want);
            if part == 0 {
                break;
            }
            // SAFETY: `part` bytes at `pos` are reserved to this writer.
            unsafe { backing.write_slice(pos, part) }.copy_from_slice(&src[written..written + part]);
            backing.advance_write(part);
            self.bytes_written(part);
            written += part;
        }
        Ok(written)
    }

    /// Zero-copy write: suspends until at least `min` bytes of space are
    /// free, then hands the visitor a writable view of the free space in
    /// place. The visitor returns how many bytes of the view it filled.
    /// Returns the committed amount.
    ///
    /// # Panics
    ///
    /// Panics when the visitor reports more bytes written than the view held,
    /// or when `min` exceeds the ring capacity. When the visitor itself
    /// panics, the reservation is refunded and the panic propagates.
    pub async fn write_with<F>(&self, min: usize, visitor: F) -> Result<usize, Error>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        assert!(min >= 1, "min must be at least one byte");
        let mut visitor = Some(visitor);
        loop {
            let target = self.effective();
            target.write_suspend(min).await?;
            if target.inner.state.tag() == Tag::Terminated {
                // terminated into a join while parked; re-route
                continue;
            }
            match target.write_with_now(min, &mut visitor) {
                Ok(n) => return Ok(n),
                Err(e) if target.should_reroute(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-suspending variant of [`write_with`](`BytePipe::write_with`).
    ///
    /// Returns `Ok(None)` when fewer than `min` bytes are free right now (the
    /// visitor did not run).
    pub fn try_write_with<F>(&self, min: usize, visitor: F) -> Result<Option<usize>, Error>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        assert!(min >= 1, "min must be at least one byte");
        let target = self.effective();
        if let Some(closed) = target.inner.closed.get() {
            return Err(closed.write_error());
        }
        if target.available_for_write() < min {
            return Ok(None);
        }
        let mut visitor = Some(visitor);
        target.write_with_now(min, &mut visitor).map(Some)
    }

    /// The visitor is taken out of the option only once a reservation is
    /// secured, so callers can retry after a re-route error.
    fn write_with_now<F>(&self, min: usize, visitor: &mut Option<F>) -> Result<usize, Error>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let lease = self.write_lease()?;
        let backing = lease.backing;

        let locked = self.inner.capacity.try_write_at_least(min);
        if locked == 0 {
            // Only a concurrent abortive close (or a join termination) can
            // take the space away from under the single writer.
            return Err(self.inner.closed.get().map(Closed::write_error).unwrap_or(Error::Closed));
        }
        let mut refund = Refund {
            capacity: &self.inner.capacity,
            amount: locked,
        };

        let pos = backing.write_position();
        let contiguous = backing.contiguous(pos);
        let visible = if locked <= contiguous {
            locked
        } else if contiguous >= min {
            contiguous
        } else {
            // The requested minimum straddles the wrap; let it spill into the
            // reserved tail and carry the overrun back afterwards.
            min.min(contiguous + backing.reserved())
        };

        let Some(visitor) = visitor.take() else {
            unreachable!("write visitor invoked twice")
        };
        // SAFETY: `visible` bytes at `pos` are covered by the reservation.
        let view = unsafe { backing.write_slice(pos, visible) };
        let written = visitor(view);
        assert!(written <= visible, "visitor wrote more bytes than the view held");

        if written > contiguous {
            backing.carry(written - contiguous);
        }
        backing.advance_write(written);
        self.bytes_written(written);
        refund.amount = locked - written;
        Ok(written)
    }

    /// Repeatedly hands the visitor writable views until it reports
    /// completion. The visitor returns the bytes filled and whether it wants
    /// another view. Returns the total committed.
    pub async fn write_while<F>(&self, mut visitor: F) -> Result<u64, Error>
    where
        F: FnMut(&mut [u8]) -> (usize, bool),
    {
        let mut total = 0u64;
        loop {
            let target = self.effective();
            target.write_suspend(1).await?;
            if target.inner.state.tag() == Tag::Terminated {
                continue;
            }
            let mut more = true;
            let mut step = Some(|view: &mut [u8]| {
                let (filled, continue_) = visitor(view);
                more = continue_;
                filled
            });
            let result = target.write_with_now(1, &mut step);
            drop(step);
            match result {
                Ok(n) => {
                    total += n as u64;
                    if !more {
                        return Ok(total);
                    }
                }
                Err(e) if target.should_reroute(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the unread content of `packet`, suspending as needed.
    pub async fn write_packet(&self, packet: Packet) -> Result<(), Error> {
        self.write_fully(packet.as_slice()).await
    }

    /// Suspends until the ring has any free space.
    pub async fn await_free_space(&self) -> Result<(), Error> {
        self.effective().write_suspend(1).await
    }
}
