//! Background thread draining the staging buffer onto the transport.
//!
//! One feeder per process per queue, started lazily by the first `put`.
//! Loop: sleep until the buffer is non-empty, take the whole batch, write
//! each item. Serialization happens before the write lock is taken so lock
//! hold time excludes encoding cost. The shutdown marker closes the write
//! end and terminates the thread.
//!
//! The feeder is detached: failures have no caller to reach, so they are
//! logged best-effort and the thread exits. Broken-pipe failures are
//! silenced entirely when the queue was configured to ignore them (the
//! consumer being gone is not an error worth surfacing). During process
//! exit the log level drops to info, since resources may already be torn
//! down around us.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::buffer::{Buffer, Entry};
use crate::codec::{self, Wire};
use crate::error::QueueError;
use crate::finalize;
use crate::ipc::lock::ShareLock;
use crate::pipe::PipeSender;
use crate::trace::{debug, error, info};

pub(crate) fn spawn<T>(
    buffer: Arc<Buffer<T>>,
    sender: Arc<PipeSender>,
    write_lock: Option<Arc<ShareLock>>,
    ignore_epipe: bool,
) -> JoinHandle<()>
where
    T: Wire + Send + 'static,
{
    std::thread::Builder::new()
        .name("aqueduct-feeder".to_string())
        .spawn(move || {
            debug!("feeder thread started");
            if let Err(err) = drain(&buffer, &sender, write_lock.as_deref()) {
                report_failure(&err, ignore_epipe);
            }
        })
        .expect("failed to spawn feeder thread")
}

fn drain<T: Wire>(
    buffer: &Buffer<T>,
    sender: &PipeSender,
    write_lock: Option<&ShareLock>,
) -> Result<(), QueueError> {
    loop {
        for entry in buffer.wait_drain() {
            match entry {
                Entry::Shutdown => {
                    debug!("feeder got shutdown marker, closing write end");
                    sender.close();
                    return Ok(());
                }
                Entry::Value(item) => {
                    // Encode outside the write lock.
                    let bytes = codec::dumps(&item)?;
                    match write_lock {
                        Some(lock) => {
                            let _guard = lock.lock();
                            sender.send_bytes(&bytes)?;
                        }
                        None => sender.send_bytes(&bytes)?,
                    }
                }
            }
        }
    }
}

fn report_failure(err: &QueueError, ignore_epipe: bool) {
    if let QueueError::Transport(transport) = err {
        if ignore_epipe && transport.is_broken_pipe() {
            return;
        }
    }
    if finalize::is_exiting() {
        info!("queue feeder failed during process exit: {err}");
    } else {
        error!("queue feeder failed: {err}");
    }
}
