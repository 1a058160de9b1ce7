//! Cross-process bounded counting semaphore — the queue's admission gate.
//!
//! The count is an `AtomicU32` in shared memory; acquisition is a CAS loop
//! that futex-sleeps while the count is zero. Unlike `sem_getvalue` on some
//! platforms, [`BoundedSemaphore::value`] is always exact here, which is
//! what lets the queue report an exact length.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use minstant::Instant;

use super::futex;
use super::shmem::{Result, Shm, ShmPath, ShmSafe};

/// Largest admissible bound; an unsized queue resolves its capacity here.
pub(crate) const SEM_VALUE_MAX: u32 = i32::MAX as u32;

#[repr(C)]
pub(crate) struct SemState {
    value: AtomicU32,
    bound: u32,
}

// SAFETY: repr(C); `bound` is written once before the region is published
// and read-only afterwards; `value` is atomic.
unsafe impl ShmSafe for SemState {}

/// Process-shared bounded counting semaphore.
pub(crate) struct BoundedSemaphore {
    shm: Shm<SemState>,
}

impl BoundedSemaphore {
    /// Create with `bound` units initially available.
    pub(crate) fn create(path: ShmPath, bound: u32) -> Result<Self> {
        let shm = Shm::create(path, |mem: &mut MaybeUninit<SemState>| {
            mem.write(SemState {
                value: AtomicU32::new(bound),
                bound,
            });
        })?;
        Ok(Self { shm })
    }

    /// Attach to a semaphore created elsewhere.
    pub(crate) fn open(path: ShmPath) -> Result<Self> {
        Ok(Self {
            shm: Shm::open(path)?,
        })
    }

    pub(crate) fn path(&self) -> &ShmPath {
        self.shm.path()
    }

    /// Take one unit.
    ///
    /// Non-blocking when `block` is false; otherwise sleeps until a unit is
    /// released or `deadline` passes. Returns whether a unit was taken.
    pub(crate) fn acquire(&self, block: bool, deadline: Option<Instant>) -> bool {
        let value = &self.shm.value;
        loop {
            let current = value.load(Ordering::Acquire);
            if current > 0 {
                if value
                    .compare_exchange_weak(
                        current,
                        current - 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            if !block {
                return false;
            }
            if !futex::wait(value, 0, deadline) {
                return false;
            }
        }
    }

    /// Return one unit and wake a sleeping acquirer.
    ///
    /// # Panics
    ///
    /// Panics if the count would exceed the bound. Every release must be
    /// paired with a prior acquire; exceeding the bound means the shared
    /// accounting was corrupted and continuing would break the capacity
    /// invariant for every attached process.
    pub(crate) fn release(&self) {
        let value = &self.shm.value;
        loop {
            let current = value.load(Ordering::Acquire);
            assert!(
                current < self.shm.bound,
                "semaphore released above its bound of {}",
                self.shm.bound
            );
            if value
                .compare_exchange_weak(current, current + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if current == 0 {
                    futex::wake_one(value);
                }
                return;
            }
        }
    }

    /// Exact current count.
    pub(crate) fn value(&self) -> u32 {
        self.shm.value.load(Ordering::Acquire)
    }

    /// Whether the gate is exhausted.
    pub(crate) fn is_zero(&self) -> bool {
        self.value() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn counts_down_and_up() {
        let sem = BoundedSemaphore::create(ShmPath::unique("sema-count"), 2).unwrap();
        assert_eq!(sem.value(), 2);
        assert!(sem.acquire(false, None));
        assert!(sem.acquire(false, None));
        assert!(sem.is_zero());
        assert!(!sem.acquire(false, None));
        sem.release();
        assert_eq!(sem.value(), 1);
        assert!(sem.acquire(false, None));
    }

    #[test]
    fn timed_acquire_expires() {
        let sem = BoundedSemaphore::create(ShmPath::unique("sema-timeout"), 1).unwrap();
        assert!(sem.acquire(true, None));
        let deadline = Instant::now() + Duration::from_millis(30);
        let start = Instant::now();
        assert!(!sem.acquire(true, Some(deadline)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn release_wakes_blocked_acquirer() {
        let path = ShmPath::unique("sema-wake");
        let sem = Arc::new(BoundedSemaphore::create(path.clone(), 1).unwrap());
        assert!(sem.acquire(true, None));

        let waiter = {
            let attached = BoundedSemaphore::open(path).unwrap();
            thread::spawn(move || attached.acquire(true, None))
        };
        thread::sleep(Duration::from_millis(20));
        sem.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    #[should_panic(expected = "above its bound")]
    fn over_release_panics() {
        let sem = BoundedSemaphore::create(ShmPath::unique("sema-over"), 1).unwrap();
        sem.release();
    }
}
