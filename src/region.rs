//! Shared region provisioning and mapping.
//!
//! A region is a byte-addressable object that every participating process
//! can map: either a POSIX shared memory object (`shm_open`) or a plain file,
//! typically under `/dev/shm`. Provisioning and mapping are separate steps
//! so a process can either own a fresh region ([`ensure`] with `create`) or
//! merely attach to one somebody else prepared.
//!
//! ```no_run
//! use shm_spinlock::region::{self, Backing};
//!
//! let backing = Backing::resolve("/dev/shm/ipc_region_demo")?;
//! region::ensure(&backing, 129, true)?;
//! let mut mapped = region::map(&backing)?;
//! assert!(mapped.flag(128).is_some());
//! mapped.unmap();
//! # Ok::<(), shm_spinlock::LockError>(())
//! ```
//!
//! Regions are never deleted by lock users. [`remove`] exists for the
//! operator that provisioned them.

#[cfg(any(target_os = "linux", target_os = "android"))]
use rustix::fs::FallocateFlags;
use rustix::fs::{self, Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::AtomicU8;

use crate::error::{LockError, Result};
use crate::trace::{debug, info, warn};

const POSIX_NAME_MAX: usize = 255;

/// Suffix used by [`Backing::named`].
pub const NAMED_SUFFIX: &str = ".ipcflag";

/// The object behind a region identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// A POSIX shared memory object, e.g. `/my-region`.
    Shm(String),
    /// A regular file, e.g. `/dev/shm/my-region` or `./lock.bin`.
    File(PathBuf),
}

impl Backing {
    /// Resolves a region identity.
    ///
    /// `/name` (one leading slash and no other) is a POSIX shared memory
    /// name; anything else is treated as a filesystem path.
    pub fn resolve(identity: &str) -> Result<Self> {
        if identity.is_empty() {
            return Err(invalid(identity, "identity must not be empty"));
        }
        match identity.strip_prefix('/') {
            Some(rest) if !rest.contains('/') => {
                validate_shm_name(identity)?;
                Ok(Backing::Shm(identity.to_string()))
            }
            _ => Ok(Backing::File(PathBuf::from(identity))),
        }
    }

    /// The single-flag region for lock `name`: `/<name>.ipcflag`.
    ///
    /// On Linux this is the same object as `/dev/shm/<name>.ipcflag`.
    pub fn named(name: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') {
            return Err(invalid(name, "lock name must be non-empty and contain no '/'"));
        }
        let identity = format!("/{name}{NAMED_SUFFIX}");
        validate_shm_name(&identity)?;
        Ok(Backing::Shm(identity))
    }

    /// The identity string all participants agree on.
    pub fn identity(&self) -> String {
        match self {
            Backing::Shm(name) => name.clone(),
            Backing::File(path) => path.display().to_string(),
        }
    }

    fn open_op(&self) -> &'static str {
        match self {
            Backing::Shm(_) => "shm_open",
            Backing::File(_) => "open",
        }
    }

    fn open(&self, create: bool) -> rustix::io::Result<OwnedFd> {
        let mode = Mode::RUSR | Mode::WUSR;
        match self {
            Backing::Shm(name) => {
                let mut flags = shm::OFlags::RDWR;
                if create {
                    flags |= shm::OFlags::CREATE;
                }
                shm::open(name.as_str(), flags, mode)
            }
            Backing::File(path) => {
                let mut flags = fs::OFlags::RDWR | fs::OFlags::CLOEXEC;
                if create {
                    flags |= fs::OFlags::CREATE;
                }
                fs::open(path.as_path(), flags, mode)
            }
        }
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

fn invalid(identity: &str, reason: &'static str) -> LockError {
    LockError::InvalidIdentity {
        identity: identity.to_string(),
        reason,
    }
}

/// POSIX only guarantees portable behavior for `/name` without further
/// slashes, at most NAME_MAX bytes long.
fn validate_shm_name(name: &str) -> Result<()> {
    if name.len() <= 1 {
        return Err(invalid(name, "shared memory name must not be empty"));
    }
    if name.len() > POSIX_NAME_MAX {
        return Err(invalid(name, "shared memory name length must be <= 255 bytes"));
    }
    Ok(())
}

fn object_size(fd: &OwnedFd, identity: &str) -> Result<u64> {
    let stat = fstat(fd).map_err(|err| LockError::open("fstat", identity, err))?;
    Ok(u64::try_from(stat.st_size).unwrap_or(0))
}

/// Extends the object to at least `min_size` bytes without ever shrinking it.
///
/// `fallocate` only extends, so a concurrent participant that already grew
/// the object further is never cut back. Filesystems without `fallocate`
/// fall back to `ftruncate` after a fresh size check.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn grow(fd: &OwnedFd, identity: &str, min_size: u64) -> Result<()> {
    match fs::fallocate(fd, FallocateFlags::empty(), 0, min_size) {
        Ok(()) => Ok(()),
        Err(Errno::OPNOTSUPP | Errno::NOSYS) => truncate_up(fd, identity, min_size),
        Err(err) => Err(LockError::open("fallocate", identity, err)),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn grow(fd: &OwnedFd, identity: &str, min_size: u64) -> Result<()> {
    truncate_up(fd, identity, min_size)
}

fn truncate_up(fd: &OwnedFd, identity: &str, min_size: u64) -> Result<()> {
    if object_size(fd, identity)? >= min_size {
        return Ok(());
    }
    ftruncate(fd, min_size).map_err(|err| LockError::open("ftruncate", identity, err))
}

/// Makes sure the backing object exists and holds at least `min_size` bytes.
///
/// A missing object is created (mode `0600`, zero-filled) only when `create`
/// is set; likewise a short object is grown only when `create` is set. The
/// object is never shrunk. Returns the object's size afterwards.
pub fn ensure(backing: &Backing, min_size: u64, create: bool) -> Result<u64> {
    let identity = backing.identity();
    let fd = backing.open(create).map_err(|err| match err {
        Errno::NOENT => LockError::NotFound {
            identity: identity.clone(),
        },
        other => LockError::open(backing.open_op(), &identity, other),
    })?;

    let size = object_size(&fd, &identity)?;
    if size >= min_size {
        return Ok(size);
    }
    if !create {
        return Err(LockError::InsufficientSize {
            identity,
            required: min_size,
            actual: size,
        });
    }

    grow(&fd, &identity, min_size)?;
    if size == 0 {
        info!(region = %identity, size = min_size, "created shared region");
    } else {
        info!(region = %identity, from = size, to = min_size, "grew shared region");
    }
    Ok(min_size)
}

/// Maps the whole backing object read/write.
///
/// The object must already exist; a missing object is an `Open` failure here,
/// not `NotFound`. The mapping is not refreshed if another party resizes the
/// object later.
pub fn map(backing: &Backing) -> Result<MappedRegion> {
    let identity = backing.identity();
    let fd = backing
        .open(false)
        .map_err(|err| LockError::open(backing.open_op(), &identity, err))?;

    let size = object_size(&fd, &identity)?;
    if size == 0 {
        return Err(LockError::InsufficientSize {
            identity,
            required: 1,
            actual: 0,
        });
    }
    let len = usize::try_from(size)
        .map_err(|_| LockError::open("mmap", &identity, Errno::OVERFLOW))?;

    // SAFETY: a fresh shared mapping of an object we just opened; it aliases
    // no Rust object in this process. The fd may be closed right after.
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
    }
    .map_err(|err| LockError::open("mmap", &identity, err))?;

    // SAFETY: mmap never returns null on success.
    let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
    debug!(region = %identity, len, "mapped shared region");

    Ok(MappedRegion {
        ptr: Some(ptr),
        len,
        identity,
    })
}

/// Deletes the backing object. Existing mappings stay valid until unmapped.
pub fn remove(backing: &Backing) -> Result<()> {
    let identity = backing.identity();
    let res = match backing {
        Backing::Shm(name) => shm::unlink(name.as_str()).map_err(|err| (err, "shm_unlink")),
        Backing::File(path) => fs::unlink(path.as_path()).map_err(|err| (err, "unlink")),
    };
    match res {
        Ok(()) => {
            info!(region = %identity, "removed shared region");
            Ok(())
        }
        Err((Errno::NOENT, _)) => Err(LockError::NotFound { identity }),
        Err((err, op)) => Err(LockError::open(op, &identity, err)),
    }
}

/// This process's read/write mapping of a shared region.
///
/// Owns only the mapping, never the region. Dropping unmaps.
pub struct MappedRegion {
    ptr: Option<NonNull<u8>>,
    len: usize,
    identity: String,
}

// SAFETY: the mapping is plain shared memory; this type only hands out
// atomics and raw pointers, so it may move and be shared across threads.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Length of the mapping in bytes, as seen when it was created.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Start of the mapping, or `None` once unmapped.
    ///
    /// Bytes other than lock flags are the caller's to coordinate.
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    /// The byte at `offset` viewed as an atomic.
    ///
    /// `None` if the region is unmapped or `offset` is out of range.
    pub fn flag(&self, offset: usize) -> Option<&AtomicU8> {
        let base = self.ptr?;
        if offset >= self.len {
            return None;
        }
        // SAFETY: offset is in bounds of a live read/write mapping that
        // outlives the borrow of `self`; u8 atomics need no alignment. Every
        // process touches the flag byte only through atomic operations.
        Some(unsafe { AtomicU8::from_ptr(base.as_ptr().add(offset)) })
    }

    /// Releases the mapping. Idempotent; failures are logged and dropped.
    pub fn unmap(&mut self) {
        let Some(ptr) = self.ptr.take() else {
            return;
        };
        // SAFETY: ptr/len describe a mapping created by `map` and not yet
        // unmapped; `take` guarantees this runs once.
        match unsafe { munmap(ptr.as_ptr().cast(), self.len) } {
            Ok(()) => {
                debug!(region = %self.identity, "unmapped shared region");
            }
            Err(err) => {
                warn!(region = %self.identity, error = %err, "munmap failed");
            }
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("identity", &self.identity)
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
