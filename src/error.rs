use std::sync::Arc;

use thiserror::Error;

/// A caller-supplied close cause, shared by both sides of the pipe.
///
/// The cause is stored once by the first [`fail()`](`crate::BytePipe::fail`)
/// and handed back, unchanged, to every operation that observes the abortive
/// close afterwards.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by pipe operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The pipe was closed for writing without a cause.
    ///
    /// Write-side operations fail with this error after a clean
    /// [`close()`](`crate::BytePipe::close`). The read side keeps draining
    /// buffered bytes and reaches end-of-stream instead.
    #[error("the channel was closed for writing")]
    Closed,

    /// The pipe reached end-of-stream before the requested amount was read.
    ///
    /// Returned by the exact-size read operations (`read_fully`, the
    /// primitive reads, `read_packet`) when the writer closed with fewer
    /// bytes remaining than required. `total_bytes_read` reflects what was
    /// actually consumed.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The pipe was cancelled.
    ///
    /// Produced by [`cancel()`](`crate::BytePipe::cancel`) and by an attached
    /// cancellation token firing. Behaves like an abortive close: both sides
    /// resume with this error and buffered bytes may be lost.
    #[error("the channel was cancelled")]
    Cancelled,

    /// Another operation on the same side of the pipe is already in progress.
    ///
    /// The pipe is strictly single-producer single-consumer: at most one task
    /// may be reading and at most one writing at any instant. A second
    /// concurrent reader (or writer) is detected either at lease acquisition
    /// or at the suspension slot and fails with this error; the pipe itself
    /// is left consistent.
    #[error("another operation on the same side is already in progress")]
    Busy,

    /// A line exceeded the limit given to `read_utf8_line`.
    #[error("line exceeds the limit of {0} bytes")]
    TooLongLine(usize),

    /// The line helpers encountered bytes that are not valid UTF-8.
    #[error("malformed UTF-8 input")]
    MalformedInput,

    /// The pipe was closed abortively with a caller-supplied cause.
    ///
    /// Every operation on either side observes the same shared [`Cause`]
    /// after the close.
    #[error("{0}")]
    Faulted(Cause),
}

impl Error {
    /// Whether this error marks an end-of-stream condition rather than a
    /// failure of the pipe itself.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::UnexpectedEof)
    }
}
