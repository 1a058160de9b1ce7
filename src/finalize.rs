//! Priority-ordered shutdown hooks.
//!
//! Queues register cleanup work here instead of relying on reclamation
//! timing: the close hook (append the shutdown marker, priority 10) and,
//! in processes that did not originate a queue, the feeder join hook
//! (priority -5). [`run_exit_hooks`] executes whatever is still pending in
//! descending priority order; a hook runs at most once whether it fires
//! early via [`Finalize::run_now`], at exit, or not at all after
//! [`Finalize::cancel`].
//!
//! The process-wide registry is [`exit_registry`]; embedding code should
//! call [`run_exit_hooks`] before process exit so buffered items are
//! flushed even for queues the program never explicitly closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

type Hook = Box<dyn FnOnce() + Send>;

struct Entry {
    id: u64,
    priority: i32,
    hook: Hook,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    exiting: AtomicBool,
}

/// A collection of cancellable, priority-ordered cleanup hooks.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                exiting: AtomicBool::new(false),
            }),
        }
    }

    /// Register a hook. Higher priorities run first.
    pub fn register(&self, priority: i32, hook: impl FnOnce() + Send + 'static) -> Finalize {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries
            .lock()
            .expect("finalize registry poisoned")
            .push(Entry {
                id,
                priority,
                hook: Box::new(hook),
            });
        Finalize {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Run all pending hooks in descending priority order.
    ///
    /// Marks the registry as exiting first, so hooks (and the threads they
    /// wake) can tell teardown-time failures from operational ones.
    pub fn run_all(&self) {
        self.inner.exiting.store(true, Ordering::Release);
        loop {
            // Pop one hook at a time: a running hook may register or cancel
            // others, so the lock cannot be held across the call.
            let next = {
                let mut entries = self
                    .inner
                    .entries
                    .lock()
                    .expect("finalize registry poisoned");
                let best = entries
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, e)| e.priority)
                    .map(|(i, _)| i);
                best.map(|i| entries.swap_remove(i))
            };
            match next {
                Some(entry) => (entry.hook)(),
                None => return,
            }
        }
    }

    /// Whether [`Registry::run_all`] has started.
    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.inner.exiting.load(Ordering::Acquire)
    }

    fn remove(inner: &Inner, id: u64) -> Option<Hook> {
        let mut entries = inner.entries.lock().expect("finalize registry poisoned");
        let idx = entries.iter().position(|e| e.id == id)?;
        Some(entries.swap_remove(idx).hook)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one registered hook.
pub struct Finalize {
    registry: Weak<Inner>,
    id: u64,
}

impl Finalize {
    /// Remove the hook without running it. Idempotent; a hook that already
    /// ran is gone and this is a no-op.
    pub fn cancel(&self) {
        if let Some(inner) = self.registry.upgrade() {
            Registry::remove(&inner, self.id);
        }
    }

    /// Run the hook now instead of at exit. No-op if it already ran or was
    /// cancelled.
    pub fn run_now(&self) {
        if let Some(inner) = self.registry.upgrade() {
            if let Some(hook) = Registry::remove(&inner, self.id) {
                hook();
            }
        }
    }
}

/// The process-wide registry consulted at exit.
pub fn exit_registry() -> &'static Registry {
    static GLOBAL: OnceLock<Registry> = OnceLock::new();
    GLOBAL.get_or_init(Registry::new)
}

/// Run every pending exit hook. Call once, just before process exit.
pub fn run_exit_hooks() {
    exit_registry().run_all();
}

/// Whether process exit has begun (drives log-level downgrades in
/// detached threads).
pub(crate) fn is_exiting() -> bool {
    exit_registry().is_exiting()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<i32>>>, tag: i32) -> impl FnOnce() + Send + 'static {
        let log = Arc::clone(log);
        move || log.lock().unwrap().push(tag)
    }

    #[test]
    fn hooks_run_in_descending_priority() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(-5, recorder(&log, -5));
        registry.register(10, recorder(&log, 10));
        registry.register(0, recorder(&log, 0));
        registry.run_all();
        assert_eq!(*log.lock().unwrap(), vec![10, 0, -5]);
        assert!(registry.is_exiting());
    }

    #[test]
    fn cancelled_hook_never_runs() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = registry.register(5, recorder(&log, 5));
        registry.register(1, recorder(&log, 1));
        handle.cancel();
        registry.run_all();
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn run_now_consumes_the_hook() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = registry.register(5, recorder(&log, 5));
        handle.run_now();
        handle.run_now();
        registry.run_all();
        assert_eq!(*log.lock().unwrap(), vec![5]);
    }

    #[test]
    fn hook_registered_during_run_also_runs() {
        let registry = Registry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let registry2 = registry.clone();
            let log2 = Arc::clone(&log);
            registry.register(10, move || {
                log2.lock().unwrap().push(10);
                let log3 = Arc::clone(&log2);
                registry2.register(0, move || log3.lock().unwrap().push(0));
            });
        }
        registry.run_all();
        assert_eq!(*log.lock().unwrap(), vec![10, 0]);
    }
}
