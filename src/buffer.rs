//! Process-local staging buffer between producers and the feeder thread.
//!
//! Producers append under the mutex and signal the condition variable; the
//! feeder sleeps on it while the deque is empty and drains the whole batch
//! in one lock acquisition. The shutdown marker is a tagged variant, so the
//! feeder's dispatch is exhaustive — no magic value ever travels through
//! the serializer. The feeder's lifecycle state shares the same mutex,
//! which makes the lazy start-if-absent check race-free.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

/// One buffered unit of work for the feeder.
pub(crate) enum Entry<T> {
    /// An accepted item, not yet written to the transport.
    Value(T),
    /// Drain everything before this marker, close the write end, terminate.
    Shutdown,
}

/// Lifecycle of the per-process feeder thread.
pub(crate) enum FeederState {
    NotStarted,
    Running(JoinHandle<()>),
    Terminated,
}

struct Inner<T> {
    items: VecDeque<Entry<T>>,
    feeder: FeederState,
}

/// Unbounded FIFO staging area plus the non-empty condition.
pub(crate) struct Buffer<T> {
    inner: Mutex<Inner<T>>,
    nonempty: Condvar,
}

impl<T> Buffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                feeder: FeederState::NotStarted,
            }),
            nonempty: Condvar::new(),
        }
    }

    /// Append an item, lazily starting the feeder on the first push in this
    /// process. `start` must spawn the drain thread; `after_append` runs
    /// while the lock is still held (the joinable extension bumps its
    /// unfinished counter there, so no observer can see the counter at zero
    /// while an accepted item is pending).
    pub(crate) fn push(
        &self,
        item: T,
        start: impl FnOnce() -> JoinHandle<()>,
        after_append: impl FnOnce(),
    ) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        if matches!(inner.feeder, FeederState::NotStarted) {
            // A fresh feeder must never replay entries a previous
            // incarnation already drained.
            inner.items.clear();
            inner.feeder = FeederState::Running(start());
        }
        inner.items.push_back(Entry::Value(item));
        after_append();
        self.nonempty.notify_one();
    }

    /// Append the shutdown marker. Only meaningful once a feeder runs; the
    /// close hook that calls this is registered at feeder start.
    pub(crate) fn push_shutdown(&self) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.items.push_back(Entry::Shutdown);
        self.nonempty.notify_one();
    }

    /// Block until at least one entry is buffered, then take the whole
    /// batch. Called only by the feeder thread.
    pub(crate) fn wait_drain(&self) -> VecDeque<Entry<T>> {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        while inner.items.is_empty() {
            inner = self
                .nonempty
                .wait(inner)
                .expect("buffer lock poisoned");
        }
        std::mem::take(&mut inner.items)
    }

    /// Take the feeder's join handle, marking it terminated. Returns `None`
    /// if the feeder never started or was already joined.
    pub(crate) fn take_join_handle(&self) -> Option<JoinHandle<()>> {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        match std::mem::replace(&mut inner.feeder, FeederState::Terminated) {
            FeederState::Running(handle) => Some(handle),
            FeederState::NotStarted => {
                inner.feeder = FeederState::NotStarted;
                None
            }
            FeederState::Terminated => None,
        }
    }
}
