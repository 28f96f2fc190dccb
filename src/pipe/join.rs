//! Splicing one pipe's producer end into another pipe.
//!
//! A joined source re-routes all further writes to the destination. Bytes
//! already buffered in the source are drained into the destination first by
//! [`copy_from`](`BytePipe::copy_from`); once the source ring is releasable
//! the source terminates and, when requested, its close follows through to
//! the destination.

use std::sync::atomic::{AtomicBool, Ordering};

use event_listener::{Event, IntoNotification};

use crate::error::Error;

use super::{BytePipe, state::Tag};

/// One-shot join record installed on the source pipe.
pub(crate) struct JoinState {
    dst: BytePipe,
    delegate_close: bool,
    completed: AtomicBool,
    propagated: AtomicBool,
    done: Event,
}

impl JoinState {
    pub(crate) fn dst(&self) -> &BytePipe {
        &self.dst
    }

    pub(crate) fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl BytePipe {
    /// Splices `src` into this pipe: buffered bytes are drained over and all
    /// further writes to `src` are delivered here. With `delegate_close`, a
    /// close of `src` closes this pipe once the drain completes.
    ///
    /// Returns the number of bytes drained from `src`'s ring. While joined,
    /// `src` is not readable from user code.
    ///
    /// # Panics
    ///
    /// Panics on self-join or when `src` is already joined.
    pub async fn join_from(&self, src: &BytePipe, delegate_close: bool) -> Result<u64, Error> {
        assert!(!self.same_channel(src), "cannot join a pipe to itself");
        // Reject a splice whose destination chain leads back to the source:
        // the record being installed would close a delegation cycle. Every
        // existing link passed this same check, so the walk terminates.
        let mut node = self.clone();
        loop {
            assert!(!node.same_channel(src), "join would create a delegation cycle");
            let next = match node.inner.joining.get() {
                Some(join) => join.dst().clone(),
                None => break,
            };
            node = next;
        }
        // The drain lands wherever this pipe currently delegates to.
        let sink = self.effective();

        // A terminated source will never produce again.
        if src.inner.state.tag() == Tag::Terminated {
            if delegate_close {
                if let Some(closed) = src.inner.closed.get() {
                    self.close_inner(closed.cause.clone());
                }
            }
            return Ok(0);
        }

        // A closed destination cannot accept the splice.
        if let Some(closed) = sink.inner.closed.get() {
            match &closed.cause {
                Some(cause) => {
                    src.close_inner(Some(cause.clone()));
                    return Err(cause.clone());
                }
                None => {
                    sink.flush();
                    return Ok(0);
                }
            }
        }

        let join = JoinState {
            dst: self.clone(),
            delegate_close,
            completed: AtomicBool::new(false),
            propagated: AtomicBool::new(false),
            done: Event::new(),
        };
        assert!(src.inner.joining.set(join).is_ok(), "pipe is already joined");
        let Some(join) = src.inner.joining.get() else {
            unreachable!()
        };

        // Fast path: the source ring is already releasable.
        src.try_terminate();

        let mut copied = 0;
        if !join.completed() {
            copied = sink.copy_from(src, u64::MAX).await?;
            // The source is drained; finish its termination. A lease still in
            // flight completes it on release, so wait for the signal.
            loop {
                src.try_terminate();
                if join.completed() {
                    break;
                }
                let listener = join.done.listen();
                if join.completed() {
                    break;
                }
                listener.await;
            }
        }
        Ok(copied)
    }

    /// Finishes a join after the source terminated: resumes everything still
    /// parked on the source, forwards the close (or just a flush) to the
    /// destination and signals completion. Idempotent.
    pub(crate) fn complete_join(&self, join: &JoinState) {
        if join.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.read_slot.notify();
        self.inner.write_slot.notify();
        if self.inner.closed.get().is_some() {
            self.propagate_close(join);
        } else {
            join.dst.flush();
        }
        join.done.notify(usize::MAX.additional().relaxed());
    }

    /// Forwards the source's close to the destination, once.
    pub(crate) fn propagate_close(&self, join: &JoinState) {
        if join.propagated.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(closed) = self.inner.closed.get() else {
            return;
        };
        if join.delegate_close {
            join.dst.close_inner(closed.cause.clone());
        } else {
            join.dst.flush();
        }
    }

    /// Streams up to `limit` bytes out of `src` into this pipe with a
    /// dual-lease loop: bytes move directly between the two rings without an
    /// intermediate buffer, suspending at either end when it is starved or
    /// full. Returns when `src` reaches end-of-stream or the limit is hit.
    pub async fn copy_from(&self, src: &BytePipe, limit: u64) -> Result<u64, Error> {
        assert!(!self.same_channel(src), "cannot copy a pipe into itself");
        let mut copied = 0u64;
        while copied < limit {
            if !src.read_suspend(1).await? {
                break;
            }
            let n = self.transfer_from(src, limit - copied)?;
            if n == 0 {
                // Destination full; park until the consumer makes space.
                self.write_suspend(1).await?;
                continue;
            }
            copied += n as u64;
            self.flush();
        }
        self.flush();
        Ok(copied)
    }

    /// Moves as many bytes as both rings allow right now, both leases held.
    fn transfer_from(&self, src: &BytePipe, limit: u64) -> Result<usize, Error> {
        let Some(src_lease) = src.read_lease()? else {
            return Ok(0);
        };
        let dst_lease = self.write_lease()?;
        let src_backing = src_lease.backing;
        let dst_backing = dst_lease.backing;

        let mut moved = 0usize;
        while (moved as u64) < limit {
            let s_pos = src_backing.read_position();
            let d_pos = dst_backing.write_position();
            let want = src_backing
                .contiguous(s_pos)
                .min(dst_backing.contiguous(d_pos))
                .min((limit - moved as u64).min(usize::MAX as u64) as usize);

            let taken = src.inner.capacity.try_read_at_most(want);
            if taken == 0 {
                break;
            }
            let n = self.inner.capacity.try_write_at_most(taken);
            if n > 0 {
                // SAFETY: both ranges are covered by fresh reservations.
                unsafe { dst_backing.write_slice(d_pos, n) }
                    .copy_from_slice(unsafe { src_backing.read_slice(s_pos, n) });
                dst_backing.advance_write(n);
                self.bytes_written(n);
                src_backing.advance_read(n);
                src.bytes_read(n);
                moved += n;
            }

            // Hand bytes that found no space back to the source.
            let excess = taken - n;
            if excess > 0 {
                src.inner.capacity.complete_write(excess);
                src.inner.capacity.flush();
                break;
            }
        }
        Ok(moved)
    }
}
