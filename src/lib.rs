//! Cross-process FIFO message queues over Unix pipes.
//!
//! `aqueduct` moves serialized messages between related processes through a
//! pipe, with capacity enforced by a shared-memory admission gate and writes
//! decoupled from producers by a per-process feeder thread.
//!
//! Three queue flavors:
//! - [`Queue`]: bounded, buffered, asynchronous sends.
//! - [`JoinableQueue`]: adds a shared task counter with
//!   [`task_done`](JoinableQueue::task_done) / [`join`](JoinableQueue::join).
//! - [`DirectQueue`]: unbounded, synchronous, no background thread.
//!
//! Queues cross process boundaries via `sharing_parts()` handles: serialize
//! the handle, fork, and `attach` in the child. Raw descriptors in a handle
//! are only valid in processes that inherit them, which is why `attach` is
//! `unsafe`.
//!
//! Processes that buffer sends should call [`finalize::run_exit_hooks`]
//! before exiting so feeders flush pending items.
//!
//! ```no_run
//! use aqueduct::Queue;
//!
//! let queue: Queue<String> = Queue::new(16)?;
//! queue.put("job".to_string())?;
//! let job = queue.get()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod buffer;
pub mod codec;
mod direct;
mod error;
mod feeder;
pub mod finalize;
pub mod ipc;
mod joinable;
pub mod pipe;
mod queue;
mod trace;

pub use codec::Wire;
pub use direct::{DirectHandle, DirectQueue};
pub use error::{QueueError, SetupError};
pub use finalize::run_exit_hooks;
pub use joinable::{JoinableHandle, JoinableQueue};
pub use queue::{Queue, QueueHandle};
pub use trace::init_tracing;
