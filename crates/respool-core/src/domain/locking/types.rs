//! Lock types and error definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use thiserror::Error;
use uuid::Uuid;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Not all resources were granted within the requested timeout
    #[error("Lock timeout: user '{user}' did not acquire its resources within {waited_ms} ms")]
    Timeout { user: String, waited_ms: u64 },

    /// The wait was cancelled before all resources were granted
    #[error("Lock cancelled: user '{user}' stopped waiting for its resources")]
    Cancelled { user: String },

    /// The wait signal completed without the lock being granted
    #[error("Pool inconsistent: user '{user}' was woken up without holding its resources")]
    ConsistencyViolation { user: String },

    /// The user (or calling context) is already registered with the pool
    #[error("User '{user}' already locked resources, call unlock first")]
    ReentrantUse { user: String },

    /// The user did not name any resources
    #[error("User '{user}' has no resources to lock")]
    NoResources { user: String },

    /// The convenience API was used outside of a context scope
    #[error("No execution context bound, wrap the caller in context::scope")]
    NoContext,
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "E300",
            Self::Cancelled { .. } => "E301",
            Self::ConsistencyViolation { .. } => "E302",
            Self::ReentrantUse { .. } => "E303",
            Self::NoResources { .. } => "E304",
            Self::NoContext => "E305",
        }
    }

    /// Whether retrying the same lock call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::ConsistencyViolation { .. }
        )
    }
}

/// Key type for a named resource
///
/// Anything hashable and comparable works. `Display` is only used for
/// logging and lock events.
pub trait ResourceName: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {}

impl<T> ResourceName for T where T: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static {}

/// Unique identifier of a pool user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Generate a new random user id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock status of a single resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Not held and nobody is waiting for it
    Available,
    /// Not held, but users are queued for it
    Claimed,
    /// Held by a user
    Held,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Claimed => write!(f, "claimed"),
            Self::Held => write!(f, "held"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_codes() {
        let timeout_err = LockError::Timeout {
            user: "P1".to_string(),
            waited_ms: 50,
        };
        assert_eq!(timeout_err.code(), "E300");
        assert!(timeout_err.is_recoverable());

        let reentrant_err = LockError::ReentrantUse {
            user: "P1".to_string(),
        };
        assert_eq!(reentrant_err.code(), "E303");
        assert!(!reentrant_err.is_recoverable());

        assert_eq!(LockError::NoContext.code(), "E305");
    }

    #[test]
    fn test_lock_error_messages() {
        let err = LockError::Timeout {
            user: "P3".to_string(),
            waited_ms: 71,
        };
        let msg = err.to_string();
        assert!(msg.contains("P3"));
        assert!(msg.contains("71 ms"));

        let err = LockError::ConsistencyViolation {
            user: "P2".to_string(),
        };
        assert!(err.to_string().contains("inconsistent"));
    }

    #[test]
    fn test_user_id_uniqueness() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn test_lock_status_display() {
        assert_eq!(LockStatus::Available.to_string(), "available");
        assert_eq!(LockStatus::Claimed.to_string(), "claimed");
        assert_eq!(LockStatus::Held.to_string(), "held");
    }
}
