//! Minimal locked queue: no capacity gate, no buffer, no feeder thread.
//!
//! `put` serializes and writes the frame synchronously under the shared
//! write lock; `get` receives under the shared read lock and deserializes
//! after releasing it. Suited for low-volume control channels where the
//! core queue's feeder machinery is overhead.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, Wire};
use crate::error::{QueueError, SetupError};
use crate::ipc::lock::ShareLock;
use crate::ipc::shmem::ShmPath;
use crate::pipe::{PipeReceiver, PipeSender, pipe_pair};

/// Serializable description of a direct queue's shared parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectHandle {
    reader_fd: i32,
    writer_fd: i32,
    read_lock: String,
    write_lock: Option<String>,
}

/// Unbounded cross-process FIFO channel with synchronous sends.
pub struct DirectQueue<T: Wire> {
    sender: PipeSender,
    receiver: PipeReceiver,
    read_lock: ShareLock,
    write_lock: Option<Arc<ShareLock>>,
    _marker: std::marker::PhantomData<fn(T) -> T>,
}

impl<T: Wire> DirectQueue<T> {
    /// Create a direct queue.
    ///
    /// # Errors
    ///
    /// Propagates shared memory or pipe creation failures.
    pub fn new() -> Result<Self, SetupError> {
        let (sender, receiver) = pipe_pair()?;
        let read_lock = ShareLock::create(ShmPath::unique("d-rlock"))?;
        let write_lock = if sender.atomic_messages() {
            None
        } else {
            Some(Arc::new(ShareLock::create(ShmPath::unique("d-wlock"))?))
        };
        Ok(Self {
            sender,
            receiver,
            read_lock,
            write_lock,
            _marker: std::marker::PhantomData,
        })
    }

    /// Describe the shared parts for a descendant process.
    ///
    /// # Errors
    ///
    /// Fails if either pipe endpoint was already closed locally.
    pub fn sharing_parts(&self) -> Result<DirectHandle, SetupError> {
        Ok(DirectHandle {
            reader_fd: self.receiver.sharing_fd()?,
            writer_fd: self.sender.sharing_fd()?,
            read_lock: self.read_lock.path().as_str().to_string(),
            write_lock: self
                .write_lock
                .as_ref()
                .map(|l| l.path().as_str().to_string()),
        })
    }

    /// Re-attach from a handle produced by [`DirectQueue::sharing_parts`].
    ///
    /// # Safety
    ///
    /// Same contract as [`crate::Queue::attach`]: the handle's raw
    /// descriptors must be live in this process's descriptor table.
    pub unsafe fn attach(handle: &DirectHandle) -> Result<Self, SetupError> {
        // SAFETY: forwarded caller contract.
        let receiver = unsafe { PipeReceiver::attach_raw(handle.reader_fd)? };
        // SAFETY: as above.
        let sender = unsafe { PipeSender::attach_raw(handle.writer_fd)? };
        let read_lock = ShareLock::open(ShmPath::new(handle.read_lock.clone())?)?;
        let write_lock = match &handle.write_lock {
            Some(path) => Some(Arc::new(ShareLock::open(ShmPath::new(path.clone())?)?)),
            None => None,
        };
        Ok(Self {
            sender,
            receiver,
            read_lock,
            write_lock,
            _marker: std::marker::PhantomData,
        })
    }

    /// Serialize and write one item. Blocks only on pipe backpressure.
    pub fn put(&self, item: &T) -> Result<(), QueueError> {
        // Encode outside the write lock.
        let bytes = codec::dumps(item)?;
        match &self.write_lock {
            Some(lock) => {
                let _guard = lock.lock();
                self.sender.send_bytes(&bytes)?;
            }
            None => self.sender.send_bytes(&bytes)?,
        }
        Ok(())
    }

    /// Receive one item, blocking until a frame arrives.
    pub fn get(&self) -> Result<T, QueueError> {
        let guard = self.read_lock.lock();
        let bytes = self.receiver.recv_bytes()?;
        drop(guard);
        Ok(codec::loads(&bytes)?)
    }

    /// Whether nothing is ready on the transport.
    ///
    /// # Errors
    ///
    /// Fails once the local read end is closed.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(!self.receiver.poll(Some(Duration::ZERO))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let queue: DirectQueue<String> = DirectQueue::new().unwrap();
        assert!(queue.is_empty().unwrap());
        queue.put(&"hello".to_string()).unwrap();
        queue.put(&"world".to_string()).unwrap();
        assert!(!queue.is_empty().unwrap());
        assert_eq!(queue.get().unwrap(), "hello");
        assert_eq!(queue.get().unwrap(), "world");
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn attached_handle_shares_the_stream() {
        let queue: DirectQueue<u64> = DirectQueue::new().unwrap();
        let handle = queue.sharing_parts().unwrap();
        // SAFETY: descriptors live in this process.
        let attached = unsafe { DirectQueue::<u64>::attach(&handle).unwrap() };
        attached.put(&99).unwrap();
        assert_eq!(queue.get().unwrap(), 99);
        queue.put(&100).unwrap();
        assert_eq!(attached.get().unwrap(), 100);
    }
}
