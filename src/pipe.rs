//! One-directional byte transport over a Unix pipe.
//!
//! ## Wire Format
//!
//! Every message is a length-prefixed frame; the length is little-endian.
//!
//! | Frame | Layout |
//! |-------|--------|
//! | Data  | `[len: u32][payload: len]` |
//!
//! A frame write is not atomic on a byte-stream pipe, so concurrent writers
//! must serialize whole frames through the cross-process write lock. The
//! [`PipeSender::atomic_messages`] capability flag reports this once at
//! construction time; callers never branch on platform identity.
//!
//! Endpoints keep their file descriptor behind `Mutex<Option<Arc<OwnedFd>>>`:
//! `close()` detaches the local reference immediately, while an in-flight
//! receive keeps its own clone alive until it returns. Descriptors survive a
//! fork, so a serialized raw fd can be re-attached in a descendant process
//! without losing buffered-but-unread frames.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustix::event::{PollFd, PollFlags, poll};
use rustix::io::Errno;
use rustix::time::Timespec;
use thiserror::Error;

/// Frames larger than this are rejected before allocation. A corrupt length
/// prefix must not drive the consumer into a huge allocation.
const MAX_FRAME_LEN: usize = 1 << 30;

const HEADER_LEN: usize = 4;

/// Errors produced by pipe endpoints.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A pipe syscall failed with an errno.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        source: Errno,
    },
    /// The peer endpoint is gone (EOF on a frame boundary).
    #[error("peer endpoint disconnected")]
    Disconnected,
    /// This endpoint was closed locally.
    #[error("endpoint is closed")]
    Closed,
    /// The length prefix exceeds the frame limit.
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
}

impl TransportError {
    fn io(op: &'static str, source: Errno) -> Self {
        Self::Io { op, source }
    }

    /// Whether this is a broken-pipe class failure (consumer already gone).
    #[must_use]
    pub const fn is_broken_pipe(&self) -> bool {
        matches!(
            self,
            Self::Io {
                source: Errno::PIPE,
                ..
            }
        )
    }
}

fn duration_to_timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

/// Shared fd slot used by both endpoint types.
///
/// `take()` on close leaves `None` behind; concurrent operations that
/// already cloned the `Arc` finish on their own reference.
#[derive(Debug)]
struct FdSlot {
    fd: Mutex<Option<Arc<OwnedFd>>>,
}

impl FdSlot {
    fn new(fd: OwnedFd) -> Self {
        Self {
            fd: Mutex::new(Some(Arc::new(fd))),
        }
    }

    fn get(&self) -> Result<Arc<OwnedFd>, TransportError> {
        self.fd
            .lock()
            .expect("fd slot poisoned")
            .clone()
            .ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.fd.lock().expect("fd slot poisoned").take();
    }

    /// Raw fd value for handle serialization. Only meaningful to a process
    /// that inherits this descriptor table (fork) or dups in-process.
    fn raw(&self) -> Result<i32, TransportError> {
        use std::os::fd::AsRawFd;
        Ok(self.get()?.as_raw_fd())
    }
}

fn write_all(fd: &OwnedFd, mut buf: &[u8]) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match rustix::io::write(fd, buf) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => buf = &buf[n..],
            Err(Errno::INTR) => {}
            Err(e) => return Err(TransportError::io("write", e)),
        }
    }
    Ok(())
}

fn read_exact(fd: &OwnedFd, mut buf: &mut [u8]) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match rustix::io::read(fd, &mut *buf) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => buf = &mut buf[n..],
            Err(Errno::INTR) => {}
            Err(e) => return Err(TransportError::io("read", e)),
        }
    }
    Ok(())
}

/// Duplicate a raw descriptor into an owned one.
///
/// # Safety
///
/// `raw` must be a valid open file descriptor in this process (inherited
/// across fork, or live in-process).
unsafe fn dup_raw(raw: i32) -> Result<OwnedFd, TransportError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    rustix::io::dup(borrowed).map_err(|e| TransportError::io("dup", e))
}

/// Write end of the transport.
#[derive(Debug)]
pub struct PipeSender {
    slot: FdSlot,
}

/// Read end of the transport.
#[derive(Debug)]
pub struct PipeReceiver {
    slot: FdSlot,
}

/// Create a connected (sender, receiver) pair.
pub fn pipe_pair() -> Result<(PipeSender, PipeReceiver), TransportError> {
    let (read, write) = rustix::pipe::pipe().map_err(|e| TransportError::io("pipe", e))?;
    Ok((
        PipeSender {
            slot: FdSlot::new(write),
        },
        PipeReceiver {
            slot: FdSlot::new(read),
        },
    ))
}

impl PipeSender {
    /// Whether a whole frame write is atomic on this transport.
    ///
    /// Byte-stream pipes interleave writes at arbitrary boundaries, so this
    /// is `false` and callers must hold the write lock per frame. Resolved
    /// once at queue construction, never at call sites.
    #[must_use]
    pub const fn atomic_messages(&self) -> bool {
        false
    }

    /// Write one length-prefixed frame.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] after a local `close()`, broken-pipe
    /// errnos once the reader is gone, [`TransportError::FrameTooLarge`]
    /// for oversized payloads.
    pub fn send_bytes(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        let fd = self.slot.get()?;
        let header = (payload.len() as u32).to_le_bytes();
        write_all(&fd, &header)?;
        write_all(&fd, payload)
    }

    /// Drop the local reference to the write end.
    ///
    /// The kernel closes the pipe once every process has done so; readers
    /// then observe EOF after draining buffered frames.
    pub fn close(&self) {
        self.slot.close();
    }

    /// Raw fd for inclusion in a serialized sharing handle.
    pub(crate) fn sharing_fd(&self) -> Result<i32, TransportError> {
        self.slot.raw()
    }

    /// Re-attach a write end from a raw descriptor.
    ///
    /// # Safety
    ///
    /// `raw` must be a live write end of an aqueduct pipe in this process's
    /// descriptor table (inherited across fork or still open locally). The
    /// descriptor is duplicated; the original stays owned by its creator.
    pub(crate) unsafe fn attach_raw(raw: i32) -> Result<Self, TransportError> {
        let fd = unsafe { dup_raw(raw)? };
        Ok(Self {
            slot: FdSlot::new(fd),
        })
    }
}

impl PipeReceiver {
    /// Read one length-prefixed frame, blocking until it arrives.
    ///
    /// # Errors
    ///
    /// [`TransportError::Disconnected`] on EOF at a frame boundary,
    /// [`TransportError::Closed`] after a local `close()`.
    pub fn recv_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let fd = self.slot.get()?;
        let mut header = [0u8; HEADER_LEN];
        read_exact(&fd, &mut header)?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        read_exact(&fd, &mut payload)?;
        Ok(payload)
    }

    /// Whether a receive would complete without blocking.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` is a pure check.
    /// EOF counts as ready so a consumer discovers disconnection promptly.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<bool, TransportError> {
        let fd = self.slot.get()?;
        let ts = timeout.map(duration_to_timespec);
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        loop {
            match poll(&mut fds, ts.as_ref()) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents();
                    return Ok(revents
                        .intersects(PollFlags::IN | PollFlags::HUP | PollFlags::ERR));
                }
                Err(Errno::INTR) => {}
                Err(e) => return Err(TransportError::io("poll", e)),
            }
        }
    }

    /// Drop the local reference to the read end.
    pub fn close(&self) {
        self.slot.close();
    }

    pub(crate) fn sharing_fd(&self) -> Result<i32, TransportError> {
        self.slot.raw()
    }

    /// Re-attach a read end from a raw descriptor.
    ///
    /// # Safety
    ///
    /// Same contract as [`PipeSender::attach_raw`].
    pub(crate) unsafe fn attach_raw(raw: i32) -> Result<Self, TransportError> {
        let fd = unsafe { dup_raw(raw)? };
        Ok(Self {
            slot: FdSlot::new(fd),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let (tx, rx) = pipe_pair().unwrap();
        tx.send_bytes(b"hello").unwrap();
        tx.send_bytes(b"").unwrap();

        assert_eq!(rx.recv_bytes().unwrap(), b"hello");
        assert_eq!(rx.recv_bytes().unwrap(), b"");
    }

    #[test]
    fn large_frame_spans_pipe_buffer() {
        let (tx, rx) = pipe_pair().unwrap();
        // Bigger than the kernel pipe buffer: the write only completes once
        // a reader drains, so the receive runs on its own thread.
        let reader = std::thread::spawn(move || rx.recv_bytes().unwrap());
        tx.send_bytes(&[7u8; 100_000]).unwrap();
        assert_eq!(reader.join().unwrap(), vec![7u8; 100_000]);
    }

    #[test]
    fn poll_reports_readiness() {
        let (tx, rx) = pipe_pair().unwrap();
        assert!(!rx.poll(Some(Duration::ZERO)).unwrap());

        tx.send_bytes(b"x").unwrap();
        assert!(rx.poll(Some(Duration::ZERO)).unwrap());

        rx.recv_bytes().unwrap();
        assert!(!rx.poll(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn eof_counts_as_ready_then_disconnects() {
        let (tx, rx) = pipe_pair().unwrap();
        tx.send_bytes(b"last").unwrap();
        tx.close();

        // Buffered frame still readable after the writer is gone.
        assert_eq!(rx.recv_bytes().unwrap(), b"last");

        // EOF is "ready": poll true, receive reports disconnection.
        assert!(rx.poll(Some(Duration::ZERO)).unwrap());
        assert!(matches!(
            rx.recv_bytes(),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn closed_endpoint_rejects_operations() {
        let (tx, rx) = pipe_pair().unwrap();
        tx.close();
        rx.close();
        assert!(matches!(tx.send_bytes(b"x"), Err(TransportError::Closed)));
        assert!(matches!(rx.recv_bytes(), Err(TransportError::Closed)));
        assert!(matches!(
            rx.poll(Some(Duration::ZERO)),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (tx, _rx) = pipe_pair().unwrap();
        tx.close();
        tx.close();
    }

    #[test]
    fn attach_shares_the_stream() {
        let (tx, rx) = pipe_pair().unwrap();
        let raw = tx.sharing_fd().unwrap();
        // SAFETY: fd is live in this process.
        let tx2 = unsafe { PipeSender::attach_raw(raw).unwrap() };

        tx.send_bytes(b"a").unwrap();
        tx2.send_bytes(b"b").unwrap();
        assert_eq!(rx.recv_bytes().unwrap(), b"a");
        assert_eq!(rx.recv_bytes().unwrap(), b"b");

        // EOF requires *all* write ends closed.
        tx.close();
        assert!(!rx.poll(Some(Duration::from_millis(10))).unwrap());
        tx2.close();
        assert!(rx.poll(Some(Duration::from_millis(200))).unwrap());
        assert!(matches!(
            rx.recv_bytes(),
            Err(TransportError::Disconnected)
        ));
    }
}
