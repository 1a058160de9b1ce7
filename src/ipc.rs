//! Cross-process synchronization primitives.
//!
//! The queue's shared state (admission gate, read/write locks, completion
//! counter) lives in named POSIX shared memory and is re-attached by path in
//! descendant processes. Blocking is futex-based; the futex words sit inside
//! the shared mappings, so waits and wakes cross the process boundary.

pub(crate) mod futex;
pub(crate) mod lock;
pub(crate) mod sema;
pub mod shmem;
