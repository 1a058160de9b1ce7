//! Cross-process mutex over a shared futex word.
//!
//! Three-state protocol: 0 = free, 1 = held, 2 = held with (possible)
//! waiters. Uncontended lock/unlock is a single CAS; the futex syscall is
//! only paid under contention. The word lives in shared memory, so the lock
//! serializes threads of every attached process.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use minstant::Instant;

use super::futex;
use super::shmem::{Result, Shm, ShmPath, ShmSafe};

const FREE: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

#[repr(C)]
pub(crate) struct LockState {
    word: AtomicU32,
}

// SAFETY: repr(C), single atomic word, valid whatever a crashed peer left
// behind (a stale HELD wedges the lock but never corrupts memory).
unsafe impl ShmSafe for LockState {}

/// Process-shared mutual exclusion lock.
pub(crate) struct ShareLock {
    shm: Shm<LockState>,
}

/// RAII guard; releases the lock on drop.
pub(crate) struct LockGuard<'a> {
    lock: &'a ShareLock,
}

impl ShareLock {
    /// Create the backing region and take ownership of its name.
    pub(crate) fn create(path: ShmPath) -> Result<Self> {
        let shm = Shm::create(path, |mem: &mut MaybeUninit<LockState>| {
            mem.write(LockState {
                word: AtomicU32::new(FREE),
            });
        })?;
        Ok(Self { shm })
    }

    /// Attach to a lock created elsewhere.
    pub(crate) fn open(path: ShmPath) -> Result<Self> {
        Ok(Self {
            shm: Shm::open(path)?,
        })
    }

    pub(crate) fn path(&self) -> &ShmPath {
        self.shm.path()
    }

    fn word(&self) -> &AtomicU32 {
        &self.shm.word
    }

    /// Acquire without blocking.
    pub(crate) fn try_lock(&self) -> Option<LockGuard<'_>> {
        // The guard must only exist on CAS success; building it eagerly
        // would run its release on the failure path.
        self.word()
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| LockGuard { lock: self })
    }

    /// Acquire, blocking at most until `deadline` (`None` blocks forever).
    pub(crate) fn lock_deadline(&self, deadline: Option<Instant>) -> Option<LockGuard<'_>> {
        if let Some(guard) = self.try_lock() {
            return Some(guard);
        }
        loop {
            // Announce contention; if the lock was free we now hold it (the
            // word reads CONTENDED, which only costs one extra wake later).
            if self.word().swap(CONTENDED, Ordering::Acquire) == FREE {
                return Some(LockGuard { lock: self });
            }
            if !futex::wait(self.word(), CONTENDED, deadline) {
                return None;
            }
        }
    }

    /// Acquire, blocking indefinitely.
    pub(crate) fn lock(&self) -> LockGuard<'_> {
        match self.lock_deadline(None) {
            Some(guard) => guard,
            // lock_deadline(None) can only return through Some.
            None => unreachable!("untimed lock acquisition cannot time out"),
        }
    }

    fn unlock(&self) {
        if self.word().swap(FREE, Ordering::Release) == CONTENDED {
            futex::wake_one(self.word());
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_lock_excludes() {
        let lock = ShareLock::create(ShmPath::unique("lock-try")).unwrap();
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn failed_try_lock_leaves_lock_held() {
        let lock = ShareLock::create(ShmPath::unique("lock-held")).unwrap();
        let guard = lock.lock();
        // Repeated failures must not release the holder's lock.
        assert!(lock.try_lock().is_none());
        assert!(lock.try_lock().is_none());
        let deadline = Instant::now() + Duration::from_millis(30);
        assert!(lock.lock_deadline(Some(deadline)).is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn deadline_expires_under_contention() {
        let lock = ShareLock::create(ShmPath::unique("lock-deadline")).unwrap();
        let _held = lock.lock();
        let deadline = Instant::now() + Duration::from_millis(30);
        assert!(lock.lock_deadline(Some(deadline)).is_none());
    }

    #[test]
    fn two_handles_one_critical_section() {
        let path = ShmPath::unique("lock-race");
        let a = Arc::new(ShareLock::create(path.clone()).unwrap());
        let b = Arc::new(ShareLock::open(path).unwrap());
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = vec![];
        for lock in [a, b] {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    // Non-atomic read-modify-write under the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }
}
