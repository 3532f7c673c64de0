//! # BackOff
//!
//! Exponential, sleep-based backoff for the cross-process acquisition loop.
//!
//! A lock held by another *process* can stay held for milliseconds, so unlike
//! an in-process spinlock there is little point in burning the CPU with pause
//! instructions. Each call to [`BackOff::wait`] puts the calling thread to
//! sleep for the current step and then doubles the step, up to a cap.
//!
//! ## Example
//! ```rust
//! use shm_spinlock::BackOff;
//!
//! let backoff = BackOff::new();
//!
//! loop {
//!     if try_acquire_lock() {
//!         break;
//!     }
//!     backoff.wait();
//! }
//!
//! fn try_acquire_lock() -> bool {
//!     // pseudo lock acquisition
//!     true
//! }
//! ```
//!
//! ## Behavior
//! - The step starts at [`BackoffConfig::initial`] (10 µs by default) and
//!   doubles after every wait, capped at [`BackoffConfig::max`] (10 ms).
//! - With jitter enabled, each sleep is stretched by a random amount of up
//!   to half the current step, so many contenders do not retry in lockstep.
//! - [`BackOff::relax`] halves the step, [`BackOff::reset`] restores it.

use std::cell::Cell;
use std::thread;
use std::time::Duration;

use crate::options::BackoffConfig;

/// An exponential backoff that sleeps between retries.
///
/// `BackOff` is per-call state: build one at the start of a retry loop and
/// drop it afterwards. It is not `Sync`.
pub struct BackOff {
    step: Cell<Duration>,
    waits: Cell<u64>,
    config: BackoffConfig,
}

impl BackOff {
    /// Creates a [`BackOff`] with the default 10 µs .. 10 ms jittered schedule.
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Creates a [`BackOff`] following `config`.
    ///
    /// A `max` below `initial` is treated as `initial`.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use shm_spinlock::{BackOff, BackoffConfig};
    ///
    /// let b = BackOff::with_config(BackoffConfig::fixed(
    ///     Duration::from_micros(50),
    ///     Duration::from_millis(1),
    /// ));
    /// assert_eq!(b.current(), Duration::from_micros(50));
    /// ```
    pub fn with_config(config: BackoffConfig) -> Self {
        let config = BackoffConfig {
            max: config.max.max(config.initial),
            ..config
        };
        Self {
            step: Cell::new(config.initial),
            waits: Cell::new(0),
            config,
        }
    }

    /// Sleeps for the current step (plus jitter) and doubles the step.
    #[inline]
    pub fn wait(&self) {
        self.wait_at_most(Duration::MAX);
    }

    /// Like [`wait`](Self::wait), but never sleeps longer than `limit`.
    ///
    /// Used by timed acquisition so the last sleep does not run past the
    /// deadline. The step still doubles.
    pub fn wait_at_most(&self, limit: Duration) {
        let step = self.step.get();
        let nap = step.saturating_add(self.jitter(step)).min(limit);
        if !nap.is_zero() {
            thread::sleep(nap);
        }
        self.step.set(step.saturating_mul(2).min(self.config.max));
        self.waits.set(self.waits.get().saturating_add(1));
    }

    fn jitter(&self, step: Duration) -> Duration {
        if !self.config.jitter {
            return Duration::ZERO;
        }
        let half = (step.as_nanos() / 2).min(u64::MAX as u128) as u64;
        if half == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::random_range(0..=half))
    }

    /// Halves the current step, never going below the initial step.
    #[inline]
    pub fn relax(&self) {
        let halved = self.step.get() / 2;
        self.step.set(halved.max(self.config.initial));
    }

    /// Returns the step the next wait will sleep for, before jitter.
    #[inline]
    pub fn current(&self) -> Duration {
        self.step.get()
    }

    /// Number of waits since creation or the last [`reset`](Self::reset).
    #[inline]
    pub fn waits(&self) -> u64 {
        self.waits.get()
    }

    /// Resets the step to the configured initial value and clears the wait
    /// count.
    #[inline]
    pub fn reset(&self) {
        self.step.set(self.config.initial);
        self.waits.set(0);
    }

    /// Resets the step to `step`, clamped to the configured cap.
    #[inline]
    pub fn reset_to(&self, step: Duration) {
        self.step.set(step.min(self.config.max));
    }
}

impl Default for BackOff {
    fn default() -> Self {
        Self::new()
    }
}
