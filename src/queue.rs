//! Cross-process FIFO queue over a pipe, buffer, and feeder thread.
//!
//! A `Queue` is constructed in one process and shared with descendants via
//! [`Queue::sharing_parts`] / [`Queue::attach`]. Producers never block on
//! the transport: `put` acquires the admission gate, appends to the
//! process-local buffer, and returns; the feeder thread drains the buffer
//! onto the pipe asynchronously. Consumers receive under the cross-process
//! read lock and deserialize after releasing it.
//!
//! Capacity accounting lives entirely in the admission gate: a unit is
//! taken before an item touches the buffer and returned only when a
//! consumer has pulled the item off the transport, so items buffered,
//! in-flight in the feeder, and sitting unread in the pipe never exceed
//! the configured capacity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::codec::{self, Wire};
use crate::error::{QueueError, SetupError};
use crate::feeder;
use crate::finalize::{self, Finalize};
use crate::ipc::lock::ShareLock;
use crate::ipc::sema::{BoundedSemaphore, SEM_VALUE_MAX};
use crate::ipc::shmem::ShmPath;
use crate::pipe::{PipeReceiver, PipeSender, pipe_pair};
use crate::trace::debug;

/// Exit-hook priority for appending the shutdown marker.
const CLOSE_PRIORITY: i32 = 10;
/// Exit-hook priority for joining the feeder; runs after close hooks.
const JOIN_PRIORITY: i32 = -5;

/// Serializable description of a queue's shared parts.
///
/// Carries shared memory names and raw pipe descriptors. The descriptors
/// are only meaningful to a process that inherits this process's
/// descriptor table (fork) or to this process itself; see
/// [`Queue::attach`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHandle {
    capacity: u32,
    ignore_epipe: bool,
    owner_pid: i32,
    reader_fd: i32,
    writer_fd: i32,
    gate: String,
    read_lock: String,
    write_lock: Option<String>,
}

/// Bounded cross-process FIFO channel.
pub struct Queue<T: Wire + Send + 'static> {
    capacity: u32,
    admission: BoundedSemaphore,
    buffer: Arc<Buffer<T>>,
    receiver: PipeReceiver,
    sender: Arc<PipeSender>,
    read_lock: ShareLock,
    write_lock: Option<Arc<ShareLock>>,
    owner_pid: i32,
    ignore_epipe: bool,
    closed: AtomicBool,
    join_cancelled: AtomicBool,
    close_hook: Mutex<Option<Finalize>>,
    join_hook: Mutex<Option<Finalize>>,
}

impl<T: Wire + Send + 'static> Queue<T> {
    /// Create a queue bounded to `capacity` items in flight.
    ///
    /// A capacity of 0 resolves to the maximum semaphore value, i.e.
    /// effectively unbounded; the first `put` never deadlocks.
    ///
    /// # Errors
    ///
    /// Propagates shared memory or pipe creation failures.
    pub fn new(capacity: u32) -> Result<Self, SetupError> {
        let capacity = if capacity == 0 { SEM_VALUE_MAX } else { capacity };
        let (sender, receiver) = pipe_pair()?;
        let admission = BoundedSemaphore::create(ShmPath::unique("gate"), capacity)?;
        let read_lock = ShareLock::create(ShmPath::unique("rlock"))?;
        // Capability resolved once: byte-stream pipes interleave concurrent
        // writes, so frame writes need the shared lock.
        let write_lock = if sender.atomic_messages() {
            None
        } else {
            Some(Arc::new(ShareLock::create(ShmPath::unique("wlock"))?))
        };
        Ok(Self {
            capacity,
            admission,
            buffer: Arc::new(Buffer::new()),
            receiver,
            sender: Arc::new(sender),
            read_lock,
            write_lock,
            owner_pid: current_pid(),
            ignore_epipe: false,
            closed: AtomicBool::new(false),
            join_cancelled: AtomicBool::new(false),
            close_hook: Mutex::new(None),
            join_hook: Mutex::new(None),
        })
    }

    /// Silence broken-pipe failures in the feeder (the consumer being gone
    /// is expected, e.g. for fire-and-forget result queues). Must be set
    /// before the first `put` in this process; the feeder snapshots the
    /// flag when it starts.
    pub fn set_ignore_broken_pipe(&mut self, ignore: bool) {
        self.ignore_epipe = ignore;
    }

    /// Describe the shared parts for a descendant process.
    ///
    /// # Errors
    ///
    /// Fails if either pipe endpoint was already closed locally.
    pub fn sharing_parts(&self) -> Result<QueueHandle, SetupError> {
        Ok(QueueHandle {
            capacity: self.capacity,
            ignore_epipe: self.ignore_epipe,
            owner_pid: self.owner_pid,
            reader_fd: self.receiver.sharing_fd()?,
            writer_fd: self.sender.sharing_fd()?,
            gate: self.admission.path().as_str().to_string(),
            read_lock: self.read_lock.path().as_str().to_string(),
            write_lock: self
                .write_lock
                .as_ref()
                .map(|l| l.path().as_str().to_string()),
        })
    }

    /// Re-attach a queue from a handle produced by [`Queue::sharing_parts`].
    ///
    /// The buffer and feeder are process-local and rebuilt fresh; the
    /// gate, locks, and pipe endpoints re-attach to the same kernel
    /// objects.
    ///
    /// # Safety
    ///
    /// The handle's raw descriptors must be live in this process's
    /// descriptor table: either the handle was produced in this process,
    /// or it crossed a fork and the descriptors were inherited. Attaching
    /// a handle whose descriptors have been closed (or reused for other
    /// files) is undefined behavior.
    pub unsafe fn attach(handle: &QueueHandle) -> Result<Self, SetupError> {
        // SAFETY: caller guarantees descriptor validity.
        let receiver = unsafe { PipeReceiver::attach_raw(handle.reader_fd)? };
        // SAFETY: as above.
        let sender = unsafe { PipeSender::attach_raw(handle.writer_fd)? };
        let admission = BoundedSemaphore::open(ShmPath::new(handle.gate.clone())?)?;
        let read_lock = ShareLock::open(ShmPath::new(handle.read_lock.clone())?)?;
        let write_lock = match &handle.write_lock {
            Some(path) => Some(Arc::new(ShareLock::open(ShmPath::new(path.clone())?)?)),
            None => None,
        };
        Ok(Self {
            capacity: handle.capacity,
            admission,
            buffer: Arc::new(Buffer::new()),
            receiver,
            sender: Arc::new(sender),
            read_lock,
            write_lock,
            owner_pid: handle.owner_pid,
            ignore_epipe: handle.ignore_epipe,
            closed: AtomicBool::new(false),
            join_cancelled: AtomicBool::new(false),
            close_hook: Mutex::new(None),
            join_hook: Mutex::new(None),
        })
    }

    /// Enqueue, blocking while the queue is at capacity.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        self.put_inner(item, true, None, || {})
    }

    /// Enqueue without blocking.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] when no admission unit is immediately free.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        self.put_inner(item, false, None, || {})
    }

    /// Enqueue, blocking at most `timeout`.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.put_inner(item, true, Some(timeout), || {})
    }

    pub(crate) fn put_inner(
        &self,
        item: T,
        block: bool,
        timeout: Option<Duration>,
        after_append: impl FnOnce(),
    ) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        // Sole backpressure point: acquire before the item touches the
        // buffer, so buffered + in-flight + unread never exceeds capacity.
        if !self.admission.acquire(block, deadline) {
            return Err(QueueError::Full);
        }
        self.buffer
            .push(item, || self.start_feeder(), after_append);
        Ok(())
    }

    /// Spawn the feeder and register its shutdown hooks. Runs under the
    /// buffer lock via `Buffer::push`.
    fn start_feeder(&self) -> std::thread::JoinHandle<()> {
        debug!("starting feeder thread");
        let handle = feeder::spawn(
            Arc::clone(&self.buffer),
            Arc::clone(&self.sender),
            self.write_lock.clone(),
            self.ignore_epipe,
        );

        let registry = finalize::exit_registry();

        // At exit (or explicit close), tell the feeder to flush and quit.
        let close_buffer = Arc::clone(&self.buffer);
        let close = registry.register(CLOSE_PRIORITY, move || close_buffer.push_shutdown());
        *self.close_hook.lock().expect("close hook poisoned") = Some(close);

        // Only non-originating processes wait for the flush at exit: every
        // other user of an originator's queue is a descendant the
        // originator will have joined before deciding to exit.
        let created_here = self.owner_pid == current_pid();
        if !created_here && !self.join_cancelled.load(Ordering::Acquire) {
            let join_buffer = Arc::clone(&self.buffer);
            let join = registry.register(JOIN_PRIORITY, move || {
                debug!("joining feeder thread at exit");
                if let Some(handle) = join_buffer.take_join_handle() {
                    let _ = handle.join();
                }
            });
            *self.join_hook.lock().expect("join hook poisoned") = Some(join);
        }

        handle
    }

    /// Dequeue, blocking until an item arrives.
    pub fn get(&self) -> Result<T, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        // Fast path: the blocking receive is the suspension point.
        let guard = self.read_lock.lock();
        let bytes = self.receiver.recv_bytes()?;
        self.admission.release();
        drop(guard);
        Ok(codec::loads(&bytes)?)
    }

    /// Dequeue without blocking.
    ///
    /// # Errors
    ///
    /// [`QueueError::Empty`] when the read lock is contended or nothing is
    /// ready on the transport.
    pub fn try_get(&self) -> Result<T, QueueError> {
        self.get_deadline(None)
    }

    /// Dequeue, blocking at most `timeout` in total across the lock wait
    /// and the transport wait.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.get_deadline(Some(Instant::now() + timeout))
    }

    /// Timed/non-blocking dequeue. `None` means do not wait at all.
    fn get_deadline(&self, deadline: Option<Instant>) -> Result<T, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let guard = match deadline {
            Some(dl) => self.read_lock.lock_deadline(Some(dl)),
            None => self.read_lock.try_lock(),
        }
        .ok_or(QueueError::Empty)?;

        // Recompute the budget after the lock wait, then spend the rest on
        // transport readiness.
        let wait = match deadline {
            Some(dl) => {
                let now = Instant::now();
                if now >= dl {
                    return Err(QueueError::Empty);
                }
                dl.duration_since(now)
            }
            None => Duration::ZERO,
        };
        if !self.receiver.poll(Some(wait))? {
            return Err(QueueError::Empty);
        }
        let bytes = self.receiver.recv_bytes()?;
        self.admission.release();
        drop(guard);
        Ok(codec::loads(&bytes)?)
    }

    /// Number of items admitted but not yet consumed. Exact on this
    /// backend; see [`Queue::supports_exact_size`].
    #[must_use]
    pub fn len(&self) -> u32 {
        self.capacity - self.admission.value()
    }

    /// Whether [`Queue::len`] is exact rather than approximate.
    ///
    /// The futex-backed gate can always report its value, so this build
    /// returns `true`. The query exists so callers can be written against
    /// backends whose semaphores cannot be read (e.g. macOS `sem_getvalue`).
    #[must_use]
    pub const fn supports_exact_size(&self) -> bool {
        true
    }

    /// Whether nothing is ready on the transport. Lags `len() == 0`
    /// slightly: an item admitted but not yet flushed by the feeder makes
    /// `len` positive while `is_empty` still reports true.
    ///
    /// # Errors
    ///
    /// Fails once the local read end is closed.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(!self.receiver.poll(Some(Duration::ZERO))?)
    }

    /// Whether the admission gate is exhausted.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.admission.is_zero()
    }

    /// Close this process's view of the queue. Idempotent.
    ///
    /// Marks the queue closed, closes the local read end, and tells the
    /// feeder to flush buffered items and shut the write end down. Items
    /// already flushed remain readable by other processes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.receiver.close();
        if let Some(hook) = self.close_hook.lock().expect("close hook poisoned").take() {
            hook.run_now();
        }
    }

    /// Wait for the feeder to flush and exit.
    ///
    /// In processes that did not originate the queue this joins the feeder
    /// registered at exit priority; in the originating process it is a
    /// no-op (descendants are joined before the originator exits).
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] if called before [`Queue::close`] — the
    /// feeder only terminates once the shutdown marker is queued.
    pub fn join_thread(&self) -> Result<(), QueueError> {
        if !self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if let Some(hook) = self.join_hook.lock().expect("join hook poisoned").take() {
            hook.run_now();
        }
        Ok(())
    }

    /// Opt out of waiting for the feeder at process exit. Best-effort:
    /// buffered items may be lost if the process exits immediately.
    pub fn cancel_join_thread(&self) {
        self.join_cancelled.store(true, Ordering::Release);
        if let Some(hook) = self.join_hook.lock().expect("join hook poisoned").take() {
            hook.cancel();
        }
    }
}

impl<T: Wire + Send + 'static> Drop for Queue<T> {
    fn drop(&mut self) {
        // Deterministic replacement for finalizer-at-GC: an unclosed queue
        // still flushes its buffer when the last local handle goes away.
        self.close();
    }
}

pub(crate) fn current_pid() -> i32 {
    rustix::process::getpid().as_raw_nonzero().get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_resolves_to_max() {
        let queue: Queue<u32> = Queue::new(0).unwrap();
        assert_eq!(queue.capacity, SEM_VALUE_MAX);
        // Must not deadlock.
        queue.put(1).unwrap();
        assert_eq!(queue.get().unwrap(), 1);
    }

    #[test]
    fn len_tracks_admission() {
        let queue: Queue<u8> = Queue::new(4).unwrap();
        assert_eq!(queue.len(), 0);
        assert!(queue.supports_exact_size());
        queue.put(1).unwrap();
        assert_eq!(queue.len(), 1);
        queue.get().unwrap();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn closed_queue_rejects_operations() {
        let queue: Queue<u8> = Queue::new(1).unwrap();
        queue.close();
        queue.close(); // idempotent
        let err = queue.put(1).unwrap_err();
        assert!(matches!(err, QueueError::Closed));
        // Usage errors are not retryable backpressure.
        assert!(!err.is_would_block());
        assert!(matches!(queue.get(), Err(QueueError::Closed)));
    }

    #[test]
    fn join_thread_requires_close() {
        let queue: Queue<u8> = Queue::new(1).unwrap();
        queue.put(1).unwrap();
        assert!(matches!(queue.join_thread(), Err(QueueError::Closed)));
        queue.get().unwrap();
        queue.close();
        queue.join_thread().unwrap();
    }

    #[test]
    fn try_get_on_empty_is_empty() {
        let queue: Queue<u8> = Queue::new(1).unwrap();
        let err = queue.try_get().unwrap_err();
        assert!(matches!(err, QueueError::Empty));
        assert!(err.is_would_block());
        assert!(matches!(
            queue.get_timeout(Duration::from_millis(20)),
            Err(QueueError::Empty)
        ));
    }

    #[test]
    fn try_put_full_after_capacity() {
        let queue: Queue<u8> = Queue::new(2).unwrap();
        queue.try_put(1).unwrap();
        queue.try_put(2).unwrap();
        assert!(queue.is_full());
        let err = queue.try_put(3).unwrap_err();
        assert!(matches!(err, QueueError::Full));
        assert!(err.is_would_block());
        assert!(matches!(
            queue.put_timeout(3, Duration::from_millis(20)),
            Err(QueueError::Full)
        ));
        assert_eq!(queue.get().unwrap(), 1);
        queue.try_put(3).unwrap();
    }
}
