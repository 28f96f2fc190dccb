//! Reader-side operations.

use crate::{buffers::Packet, error::Error, ring::RingCapacity};

use super::{BytePipe, state::Tag};

/// Refunds a speculative read reservation on drop, so a panicking visitor
/// leaves the counters exactly as if nothing had been reserved. The refund
/// routes through the write side and a counter-level flush, which restores
/// the bytes to readable without waking a writer spuriously.
struct Refund<'a> {
    capacity: &'a RingCapacity,
    amount: usize,
}

impl Drop for Refund<'_> {
    fn drop(&mut self) {
        if self.amount > 0 {
            self.capacity.complete_write(self.amount);
            self.capacity.flush();
        }
    }
}

impl BytePipe {
    /// Reads a single byte, suspending until one is available.
    pub async fn read_u8(&self) -> Result<u8, Error> {
        Ok(self.read_primitive::<1>().await?[0])
    }

    /// Reads a big-endian `u16`, suspending until it is available.
    pub async fn read_u16(&self) -> Result<u16, Error> {
        self.read_primitive().await.map(u16::from_be_bytes)
    }

    /// Reads a big-endian `u32`, suspending until it is available.
    pub async fn read_u32(&self) -> Result<u32, Error> {
        self.read_primitive().await.map(u32::from_be_bytes)
    }

    /// Reads a big-endian `u64`, suspending until it is available.
    pub async fn read_u64(&self) -> Result<u64, Error> {
        self.read_primitive().await.map(u64::from_be_bytes)
    }

    /// Reads an `f32` through its big-endian bit pattern.
    pub async fn read_f32(&self) -> Result<f32, Error> {
        self.read_primitive().await.map(|b| f32::from_bits(u32::from_be_bytes(b)))
    }

    /// Reads an `f64` through its big-endian bit pattern.
    pub async fn read_f64(&self) -> Result<f64, Error> {
        self.read_primitive().await.map(|b| f64::from_bits(u64::from_be_bytes(b)))
    }

    async fn read_primitive<const N: usize>(&self) -> Result<[u8; N], Error> {
        loop {
            if let Some(bytes) = self.try_read_primitive::<N>()? {
                return Ok(bytes);
            }
            if !self.read_suspend(N).await? {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    fn try_read_primitive<const N: usize>(&self) -> Result<Option<[u8; N]>, Error> {
        let Some(lease) = self.read_lease()? else {
            return Ok(None);
        };
        let backing = lease.backing;
        if !self.inner.capacity.try_read_exact(N) {
            return Ok(None);
        }
        let pos = backing.read_position();
        let contiguous = backing.contiguous(pos);
        if contiguous < N {
            backing.roll_bytes(N - contiguous);
        }
        let mut bytes = [0u8; N];
        // SAFETY: N bytes at pos are reserved to this reader; a straddling
        // range was linearised by roll_bytes.
        bytes.copy_from_slice(unsafe { backing.read_slice(pos, N) });
        backing.advance_read(N);
        self.bytes_read(N);
        Ok(Some(bytes))
    }

    /// Reads exactly `dst.len()` bytes, suspending as needed.
    ///
    /// Fails with [`Error::UnexpectedEof`] when the pipe closes before the
    /// buffer is filled; the bytes consumed so far still count towards
    /// [`total_bytes_read`](`BytePipe::total_bytes_read`).
    pub async fn read_fully(&self, dst: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.read_available(&mut dst[filled..]).await?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
            filled += n;
        }
        Ok(())
    }

    /// Reads whatever is available into `dst`, suspending only while the pipe
    /// is empty and open. Returns `Ok(0)` at end-of-stream (the tokio
    /// `AsyncRead` convention for the JVM-style `-1`).
    pub async fn read_available(&self, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.try_read_bulk(dst)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.read_suspend(1).await? {
                return Ok(0);
            }
        }
    }

    pub(crate) fn try_read_bulk(&self, dst: &mut [u8]) -> Result<usize, Error> {
        let Some(lease) = self.read_lease()? else {
            return Ok(0);
        };
        let backing = lease.backing;
        let mut read = 0;
        while read < dst.len() {
            let pos = backing.read_position();
            let want = (dst.len() - read).min(backing.contiguous(pos));
            let part = self.inner.capacity.try_read_at_most(want);
            if part == 0 {
                break;
            }
            // SAFETY: `part` bytes at `pos` are reserved to this reader.
            dst[read..read + part].copy_from_slice(unsafe { backing.read_slice(pos, part) });
            backing.advance_read(part);
            self.bytes_read(part);
            read += part;
        }
        Ok(read)
    }

    /// Zero-copy read: suspends until at least `min` bytes are readable, then
    /// hands the visitor a view of the buffered bytes in place. The visitor
    /// returns how many bytes of the view it consumed; the unconsumed rest
    /// stays in the pipe. Returns the consumed amount.
    ///
    /// Fails with [`Error::UnexpectedEof`] when the pipe closes with fewer
    /// than `min` bytes remaining.
    ///
    /// # Panics
    ///
    /// Panics when the visitor reports more bytes consumed than the view
    /// held, or when `min` exceeds the ring capacity. When the visitor itself
    /// panics, the reservation is refunded and the panic propagates.
    pub async fn read_with<F>(&self, min: usize, visitor: F) -> Result<usize, Error>
    where
        F: FnOnce(&[u8]) -> usize,
    {
        assert!(min >= 1, "min must be at least one byte");
        if !self.read_suspend(min).await? {
            return Err(Error::UnexpectedEof);
        }
        self.read_with_now(min, visitor)
    }

    /// Non-suspending variant of [`read_with`](`BytePipe::read_with`).
    ///
    /// Returns `Ok(None)` when the pipe is closed with fewer than `min` bytes
    /// remaining (end-of-stream), `Ok(Some(0))` when fewer than `min` bytes
    /// are buffered right now (the visitor did not run), and `Ok(Some(n))`
    /// for a completed visit.
    pub fn try_read_with<F>(&self, min: usize, visitor: F) -> Result<Option<usize>, Error>
    where
        F: FnOnce(&[u8]) -> usize,
    {
        assert!(min >= 1, "min must be at least one byte");
        if self.inner.capacity.available_for_read() < min {
            if let Some(closed) = self.inner.closed.get() {
                if let Some(cause) = &closed.cause {
                    return Err(cause.clone());
                }
                // The close flushed everything; `min` will never arrive.
                return Ok(None);
            }
            if self.inner.state.tag() == Tag::Terminated {
                return Ok(None);
            }
            return Ok(Some(0));
        }
        self.read_with_now(min, visitor).map(Some)
    }

    fn read_with_now<F>(&self, min: usize, visitor: F) -> Result<usize, Error>
    where
        F: FnOnce(&[u8]) -> usize,
    {
        let Some(lease) = self.read_lease()? else {
            return Ok(0);
        };
        let backing = lease.backing;

        // Reserve everything readable; the visitor sees as much of it as is
        // linear from the read position.
        let locked = self.inner.capacity.try_read_at_least(min);
        if locked == 0 {
            return Ok(0);
        }
        let mut refund = Refund {
            capacity: &self.inner.capacity,
            amount: locked,
        };

        let pos = backing.read_position();
        let contiguous = backing.contiguous(pos);
        let visible = if locked <= contiguous {
            locked
        } else if contiguous >= min {
            contiguous
        } else {
            // The requested minimum straddles the wrap; linearise as much of
            // it as the reserved tail allows.
            let need = min.min(contiguous + backing.reserved());
            backing.roll_bytes(need - contiguous);
            need
        };

        // SAFETY: `visible` bytes at `pos` are covered by the reservation.
        let view = unsafe { backing.read_slice(pos, visible) };
        let consumed = visitor(view);
        assert!(consumed <= visible, "visitor consumed more bytes than the view held");

        backing.advance_read(consumed);
        self.bytes_read(consumed);
        refund.amount = locked - consumed;
        Ok(consumed)
    }

    /// Discards up to `max` bytes, suspending while the pipe is empty and
    /// open. Returns the number of bytes dropped.
    pub async fn discard(&self, max: u64) -> Result<u64, Error> {
        let mut discarded = 0u64;
        while discarded < max {
            let n = self.try_discard(max - discarded)?;
            if n > 0 {
                discarded += n as u64;
                continue;
            }
            if !self.read_suspend(1).await? {
                break;
            }
        }
        Ok(discarded)
    }

    fn try_discard(&self, max: u64) -> Result<usize, Error> {
        let Some(lease) = self.read_lease()? else {
            return Ok(0);
        };
        let want = max.min(self.inner.capacity.total() as u64) as usize;
        let n = self.inner.capacity.try_read_at_most(want);
        if n > 0 {
            lease.backing.advance_read(n);
            self.bytes_read(n);
        }
        Ok(n)
    }

    /// Suspends until at least `n` bytes are readable. Returns `false` when
    /// the pipe reaches end-of-stream with fewer remaining.
    pub async fn await_at_least(&self, n: usize) -> Result<bool, Error> {
        self.read_suspend(n).await
    }

    /// Suspends until the pipe has any content or reaches end-of-stream.
    pub async fn await_content(&self) -> Result<(), Error> {
        self.read_suspend(1).await.map(|_| ())
    }

    /// Copies buffered bytes starting `offset` bytes past the read position
    /// into `dst` without consuming them, suspending until at least
    /// `offset + min` bytes are buffered. Returns the number of bytes copied,
    /// or 0 when the pipe closes before that many arrive.
    pub async fn peek_to(&self, dst: &mut [u8], offset: usize, min: usize) -> Result<usize, Error> {
        assert!(min >= 1, "min must be at least one byte");
        if !self.read_suspend(offset + min).await? {
            return Ok(0);
        }
        let Some(lease) = self.read_lease()? else {
            return Ok(0);
        };
        let backing = lease.backing;
        let avail = self.inner.capacity.available_for_read();
        let n = avail.saturating_sub(offset).min(dst.len());

        // SAFETY: the bytes are readable and this task holds the read lease,
        // so nothing consumes or overwrites them during the copy.
        let start = (backing.read_position() + offset) % backing.capacity();
        let first = n.min(backing.contiguous(start));
        dst[..first].copy_from_slice(unsafe { backing.read_slice(start, first) });
        if n > first {
            dst[first..n].copy_from_slice(unsafe { backing.read_slice(0, n - first) });
        }
        Ok(n)
    }

    /// Reads exactly `size` bytes into a [`Packet`].
    pub async fn read_packet(&self, size: usize) -> Result<Packet, Error> {
        let mut data = vec![0u8; size];
        self.read_fully(&mut data).await?;
        Ok(Packet::from(data))
    }

    /// Reads everything up to `limit` bytes until end-of-stream into a
    /// [`Packet`].
    pub async fn read_remaining(&self, limit: u64) -> Result<Packet, Error> {
        let mut packet = Packet::new();
        let mut chunk = [0u8; 4096];
        let mut remaining = limit;
        while remaining > 0 {
            let want = (chunk.len() as u64).min(remaining) as usize;
            let n = self.read_available(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            packet.write_fully(&chunk[..n]);
            remaining -= n as u64;
        }
        Ok(packet)
    }
}
