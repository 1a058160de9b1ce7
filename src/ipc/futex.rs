//! Deadline-aware futex wait/wake over shared memory words.
//!
//! All operations use process-shared futexes (no `PRIVATE` flag): the
//! `AtomicU32` lives inside an [`crate::ipc::shmem::Shm`] mapping, so
//! sleepers in one process are woken by releases in another.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;
use rustix::thread::futex;
use rustix::time::Timespec;

fn remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.duration_since(now))
    }
}

/// Sleep while `*word == expected`, up to `deadline`.
///
/// Returns `false` only when the deadline expired; any other wakeup
/// (signal, value change, spurious) returns `true` and the caller re-checks
/// its state. With `deadline == None` this only returns `true`.
pub(crate) fn wait(word: &AtomicU32, expected: u32, deadline: Option<Instant>) -> bool {
    let timeout = match deadline {
        None => None,
        Some(dl) => match remaining(dl) {
            None => return false,
            Some(left) => Some(Timespec {
                tv_sec: left.as_secs() as _,
                tv_nsec: left.subsec_nanos() as _,
            }),
        },
    };
    match futex::wait(word, futex::Flags::empty(), expected, timeout.as_ref()) {
        Ok(()) => true,
        // Value already changed before we slept.
        Err(Errno::AGAIN) => true,
        Err(Errno::TIMEDOUT) => false,
        // Signal or anything else: let the caller re-examine the word.
        Err(_) => true,
    }
}

/// Wake at most one sleeper on `word`.
pub(crate) fn wake_one(word: &AtomicU32) {
    let _ = futex::wake(word, futex::Flags::empty(), 1);
}

/// Wake every sleeper on `word`.
pub(crate) fn wake_all(word: &AtomicU32) {
    let _ = futex::wake(word, futex::Flags::empty(), i32::MAX as u32);
}
