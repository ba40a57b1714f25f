//! Pinned POSIX shared memory with type safety and typestate cleanup.
//!
//! The dispatch map must outlive any single process that maps it: a control
//! plane that restarts, or a receive hook that is detached and re-attached,
//! has to observe the same queue bindings as before. POSIX shared memory
//! gives exactly that contract — a named, kernel-reference-counted object —
//! and this module wraps it behind a safe API:
//!
//! - [`Shm<T, Mode>`] — smart pointer to a mapped object
//! - [`ShmSafe`] — marker trait for types valid in cross-process memory
//! - [`Creator`] — typestate: creates the object, unlinks the name on drop
//! - [`Opener`] — typestate: attaches to an existing object, never unlinks
//!
//! The typestate split is what implements "pinning": the creator owns the
//! name, every opener only borrows it, and the kernel keeps the pages alive
//! while any mapping remains.
//!
//! ```no_run
//! use xsteer::ShmSafe;
//! use xsteer::shmem::{Creator, Opener, Shm, ShmError, ShmPath};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(ShmSafe)]
//! #[repr(C)]
//! struct SlotWord {
//!     sock: AtomicU64,
//! }
//!
//! impl Default for SlotWord {
//!     fn default() -> Self {
//!         Self { sock: AtomicU64::new(0) }
//!     }
//! }
//!
//! // Control plane: create and publish
//! let path = ShmPath::new("/steer-slot")?;
//! let word = Shm::<SlotWord, Creator>::create(path.clone())?;
//! word.sock.store(42, Ordering::Release);
//!
//! // Receive hook: attach and read
//! let word = Shm::<SlotWord, Opener>::open(path)?;
//! assert_eq!(word.sock.load(Ordering::Acquire), 42);
//! # Ok::<(), ShmError>(())
//! ```
//!
//! On daemon startup, clean any name leaked by a crashed predecessor with
//! `rustix::shm::unlink` before creating afresh.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`] and [`ShmPath`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `mmap`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.as_str().to_string(),
            source: err,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// For portable use, `shm_open` requires the name to start with `/`, contain
/// no further slashes, and stay within `NAME_MAX` (255) bytes. Validating
/// once at construction keeps every later operation infallible on the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory object name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] when the name does not meet the
    /// POSIX requirements above.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();

        if !path.starts_with('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must start with '/'",
            });
        }

        if path[1..].contains('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must not contain additional '/' characters",
            });
        }

        if path.len() > POSIX_NAME_MAX {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path length must be <= 255 bytes",
            });
        }

        Ok(Self(path))
    }

    /// The validated name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cleanup behavior marker for shared memory handles.
///
/// `Shm<T, Creator>` and `Shm<T, Opener>` are distinct types with distinct
/// `Drop` impls, fixed at compile time. The creator unmaps and unlinks the
/// name; openers only unmap, leaving the name (and contents) pinned for
/// whoever attaches next.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates the object.
///
/// Dropping a `Shm<T, Creator>` unmaps the memory and unlinks the name.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that attach to an existing object.
///
/// Dropping a `Shm<T, Opener>` only unmaps; the name persists.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory and access from several
/// processes at once.
///
/// Implementers must guarantee:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]` — mappers may be
///   compiled separately, and the default Rust layout is unstable.
/// - **No pointers**: no heap or stack addresses of any kind; virtual
///   addresses do not transfer between processes.
/// - **Fields**: every field is itself `ShmSafe`.
/// - **Drop**: the type stays sound if `Drop` never runs; a crashed process
///   (SIGKILL) skips destructors.
/// - **Concurrency**: concurrent access from several mappings is mediated by
///   atomics. `std::sync::Mutex` is process-local and must not appear here.
///
/// Use `#[derive(ShmSafe)]` for custom types; the derive checks the layout
/// attribute and rejects pointer-carrying fields at compile time. Types used
/// with [`Shm::create`] additionally implement `Default` as their canonical
/// empty state.
pub unsafe trait ShmSafe: Send + Sync {}

// Manual implementations for primitives and atomics
macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmSafe for $t {}
        )*
    };
}

impl_shm_safe! {
    // Signed integers
    i8, i16, i32, i64, i128, isize,
    // Unsigned integers
    u8, u16, u32, u64, u128, usize,
    // Floats
    f32, f64,
    // Bool
    bool,
    // Atomics
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are ShmSafe if their elements are
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// Smart pointer to a mapped POSIX shared memory object.
///
/// Access goes through [`Deref`]; cleanup is automatic via [`Drop`] and
/// controlled by the `Mode` typestate ([`Creator`] unlinks, [`Opener`]
/// doesn't). Both processes address the same physical pages through their own
/// mappings, so all cross-process coordination inside `T` must be atomic.
///
/// Invariants upheld for the lifetime of the handle: the pointer came from a
/// successful `mmap` of exactly `size_of::<T>()` bytes (page alignment
/// satisfies any `T`), and the mapping stays valid until `Drop`.
pub struct Shm<T: ShmSafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointer targets shared memory, not thread-local data, and
// T: ShmSafe already requires Send + Sync.
unsafe impl<T: ShmSafe, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: concurrent access through &Shm<T> is access through &T, which
// T: ShmSafe (Sync) permits.
unsafe impl<T: ShmSafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: ShmSafe, Mode: ShmMode> Shm<T, Mode> {
    /// The name this object was created or opened under.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: ShmSafe> Shm<T, Creator> {
    /// Creates a new object of `size_of::<T>()` bytes, leaving the contents
    /// as the kernel's zero fill.
    ///
    /// This avoids materializing a `T` on the stack, which matters for large
    /// states (the dispatch map embeds frame arenas measured in megabytes).
    ///
    /// # Safety
    ///
    /// All-zero bytes must be a valid, canonical initial state of `T`.
    /// Zeroed atomics and zeroed byte arrays qualify; anything with a
    /// nonzero invariant (magic numbers, seeded rings) must be initialized
    /// through the returned handle before other processes attach.
    ///
    /// # Errors
    ///
    /// Fails if the name already exists (`EEXIST`), on permission or
    /// resource limits, or if the mapping itself fails.
    pub unsafe fn create_zeroed(path: ShmPath) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(e) = ftruncate(&fd, size_of::<T>() as u64) {
            // Clean up on error
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, e));
        }

        // Map into our address space
        //
        // SAFETY: a fresh mapping that aliases no existing Rust object.
        // ftruncate succeeded so the object has the right size; mmap returns
        // page-aligned memory satisfying any T's alignment; READ|WRITE is
        // required for interior mutability through atomics. Contents are the
        // kernel's zero fill, which the caller vouches is a valid T.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut T) };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: ShmSafe + Default> Shm<T, Creator> {
    /// Creates a new object and initializes it to `T::default()`.
    ///
    /// # Errors
    ///
    /// Fails if the name already exists (`EEXIST`), on permission or
    /// resource limits, or if the mapping itself fails.
    ///
    /// # Panics
    ///
    /// Panics if `T::default()` panics; the object is unmapped and unlinked
    /// before the panic propagates.
    pub fn create(path: ShmPath) -> Result<Self> {
        // SAFETY: the zero fill is immediately overwritten with T::default()
        // before the handle is returned, so no other process can observe it
        // (the name is fresh; openers race only with the creator, which is
        // the pre-existing contract of create()).
        let shm = unsafe { Self::create_zeroed(path) }?;

        let init_result = catch_unwind(AssertUnwindSafe(|| unsafe {
            std::ptr::write(shm.ptr.as_ptr(), T::default());
        }));

        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: ShmSafe> Shm<T, Opener> {
    /// Attaches to an existing object created by another process.
    ///
    /// The object's size must match `size_of::<T>()` exactly; anything else
    /// means the name is owned by a different type or build and is rejected.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist (`ENOENT`), on permission errors,
    /// on size mismatch, or if the mapping fails.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", &path, err));
            }
        };
        let expected_size = size_of::<T>() as i64;
        if stat.st_size != expected_size {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.as_str().to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // Map into our address space
        //
        // SAFETY: mapping existing shared memory that aliases no local Rust
        // object. fstat confirmed the size; mmap alignment satisfies T; the
        // creator initialized the contents before publishing the name; and
        // T: ShmSafe covers concurrent access from other mappings.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut T) };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: ShmSafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: ShmSafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid until Drop, and T: ShmSafe covers
        // shared access through &T.
        unsafe { &*self.ptr.as_ptr() }
    }
}
