//! Operational error taxonomy for queue calls.
//!
//! `Full` and `Empty` are ordinary recoverable outcomes and are never
//! logged. `Closed` and `ExcessTaskDone` are usage errors surfaced
//! immediately to the caller. Transport and codec failures propagate from
//! synchronous sends/receives; inside the feeder thread they are swallowed
//! after best-effort logging instead (see [`crate::feeder`]).

use thiserror::Error;

use crate::ipc::shmem::ShmError;
use crate::pipe::TransportError;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The admission gate could not be acquired within the caller's budget.
    #[error("queue is full")]
    Full,
    /// No item became available within the caller's budget.
    #[error("queue is empty")]
    Empty,
    /// The queue has been closed in this process.
    #[error("queue is closed")]
    Closed,
    /// `task_done()` reported more completions than items were dequeued.
    #[error("task_done() called more times than there were items")]
    ExcessTaskDone,
    /// The underlying pipe failed or the peer endpoint is gone.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Item serialization or deserialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Errors while constructing, sharing, or attaching a queue.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Creating or mapping a shared memory region failed.
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    /// Creating or duplicating a pipe endpoint failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

impl QueueError {
    /// Whether the error is a recoverable backpressure/empty signal rather
    /// than a failure.
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::Full | Self::Empty)
    }
}
