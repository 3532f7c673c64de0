//! Error types for shared region provisioning and lock construction.
//!
//! Only construction can fail. A lock that cannot be taken in time is not an
//! error: [`ShmLock::acquire`](crate::ShmLock::acquire) reports it as `false`.

use rustix::io::Errno;
use thiserror::Error;

/// Errors surfaced while resolving, provisioning or mapping a shared region.
#[derive(Error, Debug)]
pub enum LockError {
    /// The backing object does not exist and creation was not requested.
    #[error("shared region `{identity}` does not exist")]
    NotFound { identity: String },

    /// The backing object is too small and growing it was not requested.
    #[error("shared region `{identity}` is {actual} bytes, at least {required} required")]
    InsufficientSize {
        identity: String,
        required: u64,
        actual: u64,
    },

    /// A syscall needed to open, size or map the region failed.
    #[error("{op} failed for `{identity}`: {source}")]
    Open {
        op: &'static str,
        identity: String,
        #[source]
        source: Errno,
    },

    /// The identity can not name a shared region.
    #[error("invalid shared region identity `{identity}`: {reason}")]
    InvalidIdentity {
        identity: String,
        reason: &'static str,
    },
}

impl LockError {
    pub(crate) fn open(op: &'static str, identity: &str, source: Errno) -> Self {
        Self::Open {
            op,
            identity: identity.to_string(),
            source,
        }
    }
}

/// Result alias for lock and region operations.
pub type Result<T> = std::result::Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn insufficient_size_names_both_sizes() {
        let err = LockError::InsufficientSize {
            identity: "/x".to_string(),
            required: 129,
            actual: 64,
        };
        let msg = err.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("129"));
    }

    #[test]
    fn open_error_keeps_errno_as_source() {
        let err = LockError::open("mmap", "/x", Errno::NOMEM);
        assert!(err.to_string().starts_with("mmap failed for `/x`"));
        assert!(err.source().is_some());
    }
}
