//! Queue variant that tracks task completion across processes.
//!
//! Every accepted item bumps a shared `unfinished` counter; consumers call
//! [`JoinableQueue::task_done`] once per processed item and any process can
//! [`JoinableQueue::join`] to sleep until the counter returns to zero. The
//! counter lives in its own shared memory word so completion is visible
//! across the same process boundary the items cross.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::Wire;
use crate::error::{QueueError, SetupError};
use crate::ipc::futex;
use crate::ipc::shmem::{Shm, ShmPath, ShmSafe};
use crate::queue::{Queue, QueueHandle};

#[repr(C)]
pub(crate) struct TaskState {
    unfinished: AtomicU32,
}

// SAFETY: repr(C), a single atomic word, no pointers.
unsafe impl ShmSafe for TaskState {}

/// Serializable description of a joinable queue's shared parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinableHandle {
    queue: QueueHandle,
    tasks: String,
}

/// A [`Queue`] whose consumers acknowledge items, enabling [`join`].
///
/// [`join`]: JoinableQueue::join
pub struct JoinableQueue<T: Wire + Send + 'static> {
    queue: Queue<T>,
    tasks: Shm<TaskState>,
}

impl<T: Wire + Send + 'static> JoinableQueue<T> {
    /// Create a joinable queue bounded to `capacity` items in flight.
    ///
    /// # Errors
    ///
    /// Propagates shared memory or pipe creation failures.
    pub fn new(capacity: u32) -> Result<Self, SetupError> {
        let queue = Queue::new(capacity)?;
        let tasks = Shm::create(
            ShmPath::unique("tasks"),
            |mem: &mut MaybeUninit<TaskState>| {
                mem.write(TaskState {
                    unfinished: AtomicU32::new(0),
                });
            },
        )?;
        Ok(Self { queue, tasks })
    }

    /// See [`Queue::set_ignore_broken_pipe`].
    pub fn set_ignore_broken_pipe(&mut self, ignore: bool) {
        self.queue.set_ignore_broken_pipe(ignore);
    }

    /// Describe the shared parts for a descendant process.
    ///
    /// # Errors
    ///
    /// Fails if either pipe endpoint was already closed locally.
    pub fn sharing_parts(&self) -> Result<JoinableHandle, SetupError> {
        Ok(JoinableHandle {
            queue: self.queue.sharing_parts()?,
            tasks: self.tasks.path().as_str().to_string(),
        })
    }

    /// Re-attach from a handle produced by [`JoinableQueue::sharing_parts`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Queue::attach`]: the handle's raw descriptors must
    /// be live in this process's descriptor table.
    pub unsafe fn attach(handle: &JoinableHandle) -> Result<Self, SetupError> {
        // SAFETY: forwarded caller contract.
        let queue = unsafe { Queue::attach(&handle.queue)? };
        let tasks = Shm::open(ShmPath::new(handle.tasks.clone())?)?;
        Ok(Self { queue, tasks })
    }

    /// Enqueue, blocking while the queue is at capacity. The unfinished
    /// count is bumped before the call returns, so no observer can see it
    /// at zero while an accepted item is pending.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        self.put_inner(item, true, None)
    }

    /// Enqueue without blocking.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        self.put_inner(item, false, None)
    }

    /// Enqueue, blocking at most `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.put_inner(item, true, Some(timeout))
    }

    fn put_inner(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<(), QueueError> {
        let unfinished = &self.tasks.unfinished;
        // The bump happens under the buffer lock, after the item is
        // committed and before any consumer can have received it.
        self.queue.put_inner(item, block, timeout, || {
            unfinished.fetch_add(1, Ordering::AcqRel);
        })
    }

    /// See [`Queue::get`]. Receiving does not complete the task; call
    /// [`JoinableQueue::task_done`] when processing finishes.
    pub fn get(&self) -> Result<T, QueueError> {
        self.queue.get()
    }

    /// See [`Queue::try_get`].
    pub fn try_get(&self) -> Result<T, QueueError> {
        self.queue.try_get()
    }

    /// See [`Queue::get_timeout`].
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.queue.get_timeout(timeout)
    }

    /// Mark one previously dequeued item as fully processed.
    ///
    /// # Errors
    ///
    /// [`QueueError::ExcessTaskDone`] when completions would outnumber
    /// accepted items.
    pub fn task_done(&self) -> Result<(), QueueError> {
        let unfinished = &self.tasks.unfinished;
        loop {
            let current = unfinished.load(Ordering::Acquire);
            if current == 0 {
                return Err(QueueError::ExcessTaskDone);
            }
            if unfinished
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if current == 1 {
                    futex::wake_all(unfinished);
                }
                return Ok(());
            }
        }
    }

    /// Block until every accepted item has been marked done.
    ///
    /// Returns immediately when nothing is outstanding.
    pub fn join(&self) {
        let unfinished = &self.tasks.unfinished;
        loop {
            let current = unfinished.load(Ordering::Acquire);
            if current == 0 {
                return;
            }
            futex::wait(unfinished, current, None);
        }
    }

    /// Items accepted but not yet marked done.
    #[must_use]
    pub fn unfinished_tasks(&self) -> u32 {
        self.tasks.unfinished.load(Ordering::Acquire)
    }

    /// See [`Queue::len`].
    #[must_use]
    pub fn len(&self) -> u32 {
        self.queue.len()
    }

    /// See [`Queue::supports_exact_size`].
    #[must_use]
    pub const fn supports_exact_size(&self) -> bool {
        self.queue.supports_exact_size()
    }

    /// See [`Queue::is_empty`].
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        self.queue.is_empty()
    }

    /// See [`Queue::is_full`].
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// See [`Queue::close`].
    pub fn close(&self) {
        self.queue.close();
    }

    /// See [`Queue::join_thread`].
    pub fn join_thread(&self) -> Result<(), QueueError> {
        self.queue.join_thread()
    }

    /// See [`Queue::cancel_join_thread`].
    pub fn cancel_join_thread(&self) {
        self.queue.cancel_join_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn task_counter_balances() {
        let queue: JoinableQueue<u32> = JoinableQueue::new(4).unwrap();
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        assert_eq!(queue.unfinished_tasks(), 2);
        queue.get().unwrap();
        queue.get().unwrap();
        // Receiving alone does not complete tasks.
        assert_eq!(queue.unfinished_tasks(), 2);
        queue.task_done().unwrap();
        queue.task_done().unwrap();
        assert_eq!(queue.unfinished_tasks(), 0);
        queue.join();
    }

    #[test]
    fn excess_task_done_is_an_error() {
        let queue: JoinableQueue<u8> = JoinableQueue::new(1).unwrap();
        assert!(matches!(
            queue.task_done(),
            Err(QueueError::ExcessTaskDone)
        ));
        queue.put(7).unwrap();
        queue.get().unwrap();
        queue.task_done().unwrap();
        assert!(matches!(
            queue.task_done(),
            Err(QueueError::ExcessTaskDone)
        ));
    }

    #[test]
    fn join_returns_immediately_when_idle() {
        let queue: JoinableQueue<u8> = JoinableQueue::new(1).unwrap();
        queue.join();
    }

    #[test]
    fn join_wakes_when_last_task_completes() {
        let queue: JoinableQueue<u8> = JoinableQueue::new(2).unwrap();
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        let handle = queue.sharing_parts().unwrap();
        // SAFETY: descriptors live in this process.
        let worker = unsafe { JoinableQueue::<u8>::attach(&handle).unwrap() };
        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            worker.get().unwrap();
            worker.task_done().unwrap();
            worker.get().unwrap();
            worker.task_done().unwrap();
        });

        queue.join();
        assert_eq!(queue.unfinished_tasks(), 0);
        drainer.join().unwrap();
    }
}
