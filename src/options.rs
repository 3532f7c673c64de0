//! Construction options for [`ShmLock`](crate::ShmLock).

use std::time::Duration;

/// Default first sleep between failed acquisition attempts.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_micros(10);

/// Default upper bound on a single backoff sleep.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Tuning for the sleep-based retry loop of [`ShmLock::acquire`](crate::ShmLock::acquire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First sleep after a failed CAS.
    pub initial: Duration,
    /// Cap for the doubling sleep.
    pub max: Duration,
    /// Add up to half a step of random delay to each sleep.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Jitter-free config, useful when timing must be predictable.
    pub const fn fixed(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: false,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            jitter: true,
        }
    }
}

/// Where the lock flag lives and how to provision its region.
///
/// # Example
/// ```
/// use shm_spinlock::LockOptions;
///
/// let opts = LockOptions::new("/dev/shm/ipc_region_demo")
///     .offset(128)
///     .create(false);
/// assert_eq!(opts.required_size(), 129);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    pub(crate) identity: String,
    pub(crate) offset: usize,
    pub(crate) create: bool,
    pub(crate) min_size: Option<u64>,
    pub(crate) backoff: BackoffConfig,
}

impl LockOptions {
    /// Options for a flag at offset 0 of `identity`, created on demand.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            offset: 0,
            create: true,
            min_size: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Byte offset of the flag inside the region.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Create or grow the backing object when it is missing or too small.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Provision at least `size` bytes. Never less than `offset + 1`.
    pub fn min_size(mut self, size: u64) -> Self {
        self.min_size = Some(size);
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Size the region must have before the flag may be mapped.
    ///
    /// Saturates at `u64::MAX`; no region is that large, so an absurd offset
    /// fails as [`InsufficientSize`](crate::LockError::InsufficientSize).
    pub fn required_size(&self) -> u64 {
        let floor = (self.offset as u64).saturating_add(1);
        self.min_size.map_or(floor, |hint| hint.max(floor))
    }
}
