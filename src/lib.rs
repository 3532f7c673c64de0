//! # shm-spinlock
//!
//! A mutual-exclusion lock shared between independent **processes**, kept in
//! a single byte of a memory-mapped shared region and driven purely by atomic
//! compare-and-swap. There are no semaphores, futexes or file locks; waiting
//! contenders sleep with exponential backoff between attempts.
//!
//! The crate includes:
//!
//! - [`ShmLock`] — the lock handle: `acquire`, `release`, `is_locked`, `close`.
//! - [`region`] — provisioning and mapping of the backing shared region.
//! - [`BackOff`] — the sleep-based exponential backoff used while waiting.
//!
//! ## Quick Example
//!
//! ```no_run
//! use std::time::Duration;
//! use shm_spinlock::{LockOptions, ShmLock};
//!
//! // Every cooperating process opens the same identity and offset.
//! let lock = ShmLock::open(LockOptions::new("/dev/shm/ipc_region_demo").offset(128))?;
//!
//! if lock.acquire(Some(Duration::from_millis(500))) {
//!     // critical section
//!     lock.release();
//! }
//!
//! // Or scoped:
//! if let Some(_guard) = lock.lock() {
//!     // critical section, released on drop
//! }
//! # Ok::<(), shm_spinlock::LockError>(())
//! ```
//!
//! ## Layout contract
//!
//! Exactly one byte at the chosen offset, `0` for unlocked and `1` for
//! locked. Independently built participants interoperate as long as they
//! agree on the identity and offset and follow that rule.
//!
//! ## Safety & Usage Notes
//!
//! - Prefer short critical sections; waiting costs CPU and wake-up latency.
//! - The lock is **not reentrant** and **not fair**.
//! - A crashed holder leaves the lock taken until someone resets the byte.
//! - `release` does not check who holds the lock.
//!
//! ## Feature flags
//! - **`tracing`** — emit `tracing` events and enable [`init_tracing`].

pub mod backoff;
pub mod error;
pub mod options;
pub mod region;
pub mod spinlock;
mod trace;

pub use backoff::BackOff;
pub use error::{LockError, Result};
pub use options::{BackoffConfig, LockOptions};
pub use region::{Backing, MappedRegion};
pub use spinlock::{ShmGuard, ShmLock};
pub use trace::init_tracing;
