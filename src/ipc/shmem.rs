//! POSIX shared memory host regions for queue synchronization state.
//!
//! [`Shm<T>`] maps a named shared memory object holding one `repr(C)` state
//! struct. The creating process initializes the region and publishes an init
//! magic with release ordering; openers wait for the magic before touching
//! the state, so a half-initialized region is never observable.
//!
//! Ownership is a runtime property (`owner` flag), not a typestate: a queue
//! handle decides at attach time whether it created the region. The owner
//! unlinks the name on drop; openers only unmap.

use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Published once the creator has fully initialized the hosted state.
const INIT_MAGIC: u32 = 0x4151_4455; // "AQDU"

/// How long an opener waits for the creator to finish initialization.
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

const POSIX_NAME_MAX: usize = 255;

/// Errors produced by [`Shm`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The shared memory name is not valid for `shm_open`.
    #[error("invalid shared memory name `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `mmap`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: Errno,
    },
    /// The existing object has a different size than the hosted type.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: u64,
    },
    /// The creator never published the init magic within the wait budget.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: Errno) -> Self {
        Self::Posix {
            op,
            path: path.as_str().to_string(),
            source,
        }
    }
}

/// Types safe to host in a shared memory region.
///
/// # Safety
///
/// Implementers must be `repr(C)`, contain no pointers or references, stay
/// valid if `Drop` never runs (a crashed peer bypasses destructors), and
/// mediate all concurrent mutation through atomics.
pub(crate) unsafe trait ShmSafe: Send + Sync {}

/// Validated POSIX shared memory object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validate a name against the portable `shm_open` requirements.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "name must start with '/'",
            });
        }
        if path[1..].contains('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "name must not contain additional '/' characters",
            });
        }
        if path.len() > POSIX_NAME_MAX {
            return Err(ShmError::InvalidPath {
                path,
                reason: "name must be <= 255 bytes",
            });
        }
        Ok(Self(path))
    }

    /// A process-unique name for a new region: `/aq-<pid>-<seq>-<tag>`.
    pub(crate) fn unique(tag: &str) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let pid = rustix::process::getpid().as_raw_nonzero().get();
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("/aq-{pid}-{seq}-{tag}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Region layout: init marker first, hosted state after.
#[repr(C)]
struct Hosted<T> {
    magic: AtomicU32,
    state: T,
}

/// Mapped shared memory region hosting one `T`.
///
/// Dereferences to the hosted state. On drop the mapping is removed; the
/// owner additionally unlinks the name so the kernel reclaims the object
/// once every process has unmapped it.
pub(crate) struct Shm<T: ShmSafe> {
    ptr: NonNull<Hosted<T>>,
    path: ShmPath,
    owner: bool,
    _marker: PhantomData<Hosted<T>>,
}

// SAFETY: the mapping is plain shared memory; T: ShmSafe requires Send+Sync
// and atomic-mediated mutation.
unsafe impl<T: ShmSafe> Send for Shm<T> {}
unsafe impl<T: ShmSafe> Sync for Shm<T> {}

impl<T: ShmSafe> Shm<T> {
    /// Create a new region, initialize the state via `init`, and publish it.
    ///
    /// The caller becomes the owner: dropping this handle unlinks the name.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, `EACCES`/`ENOMEM`/`EMFILE` from the
    /// kernel, or mapping failures.
    pub(crate) fn create(
        path: ShmPath,
        init: impl FnOnce(&mut MaybeUninit<T>),
    ) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| ShmError::posix("shm_open", &path, e))?;

        let size = size_of::<Hosted<T>>();
        if let Err(e) = ftruncate(&fd, size as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, e));
        }

        // SAFETY: fresh mapping of a correctly sized object; page alignment
        // satisfies any repr(C) state struct; no aliasing with local memory.
        let raw = match unsafe {
            mmap(
                null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", &path, e));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<Hosted<T>>()) };

        // SAFETY: exclusive access until the magic is published; openers
        // spin on the marker before dereferencing the state.
        unsafe {
            let hosted = ptr.as_ptr();
            (&raw mut (*hosted).magic).write(AtomicU32::new(0));
            let state = &raw mut (*hosted).state;
            init(&mut *state.cast::<MaybeUninit<T>>());
            (*hosted).magic.store(INIT_MAGIC, Ordering::Release);
        }

        Ok(Self {
            ptr,
            path,
            owner: true,
            _marker: PhantomData,
        })
    }

    /// Map an existing region created by another handle.
    ///
    /// Waits up to one second for the creator to publish the init magic.
    ///
    /// # Errors
    ///
    /// `ENOENT` if the name does not exist, size mismatches against the
    /// hosted type, or [`ShmError::InitTimeout`].
    pub(crate) fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|e| ShmError::posix("shm_open", &path, e))?;

        let size = size_of::<Hosted<T>>();
        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(e) => {
                drop(fd);
                return Err(ShmError::posix("fstat", &path, e));
            }
        };
        if stat.st_size as u64 != size as u64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.as_str().to_string(),
                expected: size,
                actual: stat.st_size as u64,
            });
        }

        // SAFETY: object exists with the verified size; the mapping aliases
        // no local Rust objects; concurrent access goes through atomics per
        // the ShmSafe contract.
        let raw = match unsafe {
            mmap(
                null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                drop(fd);
                return Err(ShmError::posix("mmap", &path, e));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<Hosted<T>>()) };

        let deadline = std::time::Instant::now() + INIT_TIMEOUT;
        // SAFETY: the marker is the first field of the mapped region.
        while unsafe { ptr.as_ref() }.magic.load(Ordering::Acquire) != INIT_MAGIC {
            if std::time::Instant::now() >= deadline {
                // SAFETY: unmapping our own mapping.
                unsafe {
                    let _ = munmap(ptr.as_ptr().cast(), size);
                }
                return Err(ShmError::InitTimeout {
                    path: path.as_str().to_string(),
                });
            }
            std::hint::spin_loop();
        }

        Ok(Self {
            ptr,
            path,
            owner: false,
            _marker: PhantomData,
        })
    }

    /// The region's name, for inclusion in a sharing handle.
    pub(crate) fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: ShmSafe> Drop for Shm<T> {
    fn drop(&mut self) {
        // SAFETY: unmapping the mapping established at construction.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<Hosted<T>>());
        }
        if self.owner {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: ShmSafe> Deref for Shm<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: mapped and initialized for the lifetime of self; the init
        // magic was observed with acquire ordering.
        unsafe { &self.ptr.as_ref().state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Counter {
        value: AtomicU32,
    }

    // SAFETY: repr(C), atomic-only mutation, no pointers.
    unsafe impl ShmSafe for Counter {}

    fn init_counter(mem: &mut MaybeUninit<Counter>) {
        mem.write(Counter {
            value: AtomicU32::new(0),
        });
    }

    #[test]
    fn create_open_share_state() {
        let path = ShmPath::unique("shmem-share");
        let creator = Shm::<Counter>::create(path.clone(), init_counter).unwrap();
        creator.value.store(41, Ordering::SeqCst);

        {
            let opener = Shm::<Counter>::open(path).unwrap();
            assert_eq!(opener.value.load(Ordering::SeqCst), 41);
            opener.value.fetch_add(1, Ordering::SeqCst);
        }

        assert_eq!(creator.value.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn owner_unlinks_on_drop() {
        let path = ShmPath::unique("shmem-unlink");
        let creator = Shm::<Counter>::create(path.clone(), init_counter).unwrap();
        drop(creator);
        assert!(matches!(
            Shm::<Counter>::open(path),
            Err(ShmError::Posix { op: "shm_open", .. })
        ));
    }

    #[test]
    fn size_mismatch_detected() {
        #[repr(C)]
        struct Wide {
            a: AtomicU32,
            b: AtomicU32,
            c: [u8; 128],
        }
        // SAFETY: repr(C), no pointers; test-only.
        unsafe impl ShmSafe for Wide {}

        let path = ShmPath::unique("shmem-size");
        let _creator = Shm::<Counter>::create(path.clone(), init_counter).unwrap();
        assert!(matches!(
            Shm::<Wide>::open(path),
            Err(ShmError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn path_validation() {
        assert!(ShmPath::new("/fine-name").is_ok());
        assert!(matches!(
            ShmPath::new("missing-slash"),
            Err(ShmError::InvalidPath { .. })
        ));
        assert!(matches!(
            ShmPath::new("/nested/name"),
            Err(ShmError::InvalidPath { .. })
        ));
        let long = format!("/{}", "x".repeat(300));
        assert!(matches!(
            ShmPath::new(long),
            Err(ShmError::InvalidPath { .. })
        ));
    }
}
