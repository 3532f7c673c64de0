//! # ShmLock
//!
//! A spinlock whose state is one byte of shared memory, so that independent
//! processes mapping the same region contend for the same lock.
//!
//! The flag byte is `0` when unlocked and `1` when locked. It only ever moves
//! `0 -> 1` through a sequentially consistent compare-and-swap and `1 -> 0`
//! through a sequentially consistent store. No kernel lock is involved: a
//! contender that loses the CAS sleeps for an exponentially growing
//! [`BackOff`] step and tries again.
//!
//! ## Example
//! ```no_run
//! use std::time::Duration;
//! use shm_spinlock::{LockOptions, ShmLock};
//!
//! let lock = ShmLock::open(LockOptions::new("/dev/shm/ipc_region_demo").offset(128))?;
//!
//! if lock.acquire(Some(Duration::from_secs(5))) {
//!     // critical section
//!     lock.release();
//! }
//! # Ok::<(), shm_spinlock::LockError>(())
//! ```
//!
//! ## Caveats
//! - The lock is **not fair**; a newcomer may beat a contender that has been
//!   waiting longer.
//! - It is **not reentrant**. A second `acquire` from the holder waits forever
//!   (or until its timeout).
//! - [`ShmLock::release`] is not ownership checked. Any handle can clear the
//!   flag, breaking exclusion for the real holder.
//! - A holder that dies leaves the flag at `1`. Nothing detects this; an
//!   operator has to reset the byte (e.g. with `shm-spinlock reset`).
//! - Only the flag byte is protected. Other bytes of the region are the
//!   caller's to coordinate.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering::Relaxed, Ordering::SeqCst};
use std::time::{Duration, Instant};

use crate::error::{LockError, Result};
use crate::options::{BackoffConfig, LockOptions};
use crate::region::{self, Backing, MappedRegion};
use crate::trace::{debug, trace, warn};
use crate::BackOff;

/// Flag value of a free lock.
pub const UNLOCKED: u8 = 0;

/// Flag value of a held lock.
pub const LOCKED: u8 = 1;

/// A per-process handle on a lock flag inside a shared region.
///
/// Every process builds its own handle against the same identity and offset.
/// The handle owns only its mapping; the flag's state lives in the region.
pub struct ShmLock {
    region: MappedRegion,
    offset: usize,
    backoff: BackoffConfig,
}

/// Holds a [`ShmLock`] and releases it when dropped.
pub struct ShmGuard<'a> {
    lock: &'a ShmLock,
}

impl Drop for ShmGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl ShmLock {
    /// Provisions (if allowed), maps and binds the flag described by `options`.
    ///
    /// # Errors
    /// - [`LockError::NotFound`] if the region is missing and `create` is off.
    /// - [`LockError::InsufficientSize`] if the region is smaller than
    ///   [`LockOptions::required_size`] and `create` is off.
    /// - [`LockError::Open`] if opening, sizing or mapping fails.
    /// - [`LockError::InvalidIdentity`] if the identity names nothing.
    pub fn open(options: LockOptions) -> Result<Self> {
        let backing = Backing::resolve(&options.identity)?;
        Self::open_backing(&backing, &options)
    }

    /// A single-flag lock in the auto-provisioned region `/<name>.ipcflag`.
    pub fn named(name: &str) -> Result<Self> {
        let backing = Backing::named(name)?;
        Self::open_backing(&backing, &LockOptions::new(backing.identity()))
    }

    fn open_backing(backing: &Backing, options: &LockOptions) -> Result<Self> {
        let required = options.required_size();
        region::ensure(backing, required, options.create)?;

        let region = region::map(backing)?;
        if region.flag(options.offset).is_none() {
            return Err(LockError::InsufficientSize {
                identity: backing.identity(),
                required,
                actual: region.len() as u64,
            });
        }

        debug!(region = %backing, offset = options.offset, "opened lock handle");
        Ok(Self {
            region,
            offset: options.offset,
            backoff: options.backoff,
        })
    }

    fn flag(&self) -> Option<&AtomicU8> {
        let flag = self.region.flag(self.offset);
        if flag.is_none() {
            warn!(region = %self.region.identity(), offset = self.offset, "lock handle used after close");
        }
        flag
    }

    /// Acquires the lock, retrying with backoff until `timeout` elapses.
    ///
    /// `None` waits forever. `Some(Duration::ZERO)` makes exactly one
    /// attempt. Returns `false` if the timeout ran out (or the handle is
    /// closed); the time spent is then at least `timeout` and at most about
    /// one backoff step more.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let Some(flag) = self.flag() else {
            return false;
        };

        let start = Instant::now();
        let backoff = BackOff::with_config(self.backoff);
        loop {
            if compare_and_lock(flag) {
                trace!(offset = self.offset, attempts = backoff.waits() + 1, "acquired lock");
                return true;
            }

            let remaining = match timeout {
                None => Duration::MAX,
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        debug!(
                            offset = self.offset,
                            attempts = backoff.waits() + 1,
                            ?limit,
                            "lock acquisition timed out"
                        );
                        return false;
                    }
                    limit - elapsed
                }
            };
            backoff.wait_at_most(remaining);
        }
    }

    /// One compare-and-swap attempt, no waiting.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.flag().is_some_and(compare_and_lock)
    }

    /// Clears the flag unconditionally.
    ///
    /// Whoever calls this unlocks the lock, holder or not.
    #[inline]
    pub fn release(&self) {
        if let Some(flag) = self.flag() {
            flag.store(UNLOCKED, SeqCst);
        }
    }

    /// Best-effort peek at the flag. Stale as soon as it returns; use it for
    /// diagnostics only.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flag().is_some_and(|flag| flag.load(Relaxed) != UNLOCKED)
    }

    /// Unmaps this handle's view of the region. Leaves the flag untouched.
    ///
    /// Idempotent. Afterwards the handle acquires nothing and releases
    /// nothing.
    pub fn close(&mut self) {
        self.region.unmap();
    }

    /// Blocks until the lock is held and returns a guard releasing it.
    ///
    /// `None` only if the handle is closed.
    pub fn lock(&self) -> Option<ShmGuard<'_>> {
        self.acquire(None).then(|| ShmGuard { lock: self })
    }

    /// Single attempt; returns a guard if the flag was free.
    pub fn try_lock(&self) -> Option<ShmGuard<'_>> {
        self.try_acquire().then(|| ShmGuard { lock: self })
    }

    /// Like [`acquire`](Self::acquire) with a timeout, returning a guard.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ShmGuard<'_>> {
        self.acquire(Some(timeout)).then(|| ShmGuard { lock: self })
    }

    /// Runs `f` while holding the lock.
    ///
    /// `None` if the handle is closed.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.lock()?;
        Some(f())
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn identity(&self) -> &str {
        self.region.identity()
    }

    /// The mapping the flag lives in, for callers keeping payload beside it.
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }
}

#[inline]
fn compare_and_lock(flag: &AtomicU8) -> bool {
    flag.compare_exchange(UNLOCKED, LOCKED, SeqCst, SeqCst).is_ok()
}

impl fmt::Debug for ShmLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmLock")
            .field("region", &self.region)
            .field("offset", &self.offset)
            .finish()
    }
}
