//! respool Core Library
//!
//! This crate provides a pool of named resources that are locked as sets:
//! - All-or-nothing locking of a user's whole resource set
//! - Deadlock freedom without any lock ordering discipline
//! - Starvation avoidance through per-user priorities
//! - Timeouts and cancellation with automatic rollback
//! - Context-bound locking without explicit user handles
//! - Lock events for diagnostics and statistics

pub mod config;
pub mod domain;
pub mod error;

pub use domain::locking::context;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::domain::events::{DomainEvent, InMemoryEventStore};
    pub use crate::domain::locking::{
        LockError, LockEvent, LockEventType, LockManager, LockResult, LockStatus, PoolGuard,
        PoolUser, ResourceName, UserId,
    };
    pub use crate::error::{Error, Result};
}
