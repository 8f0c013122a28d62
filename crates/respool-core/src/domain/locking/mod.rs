//! Named resource locking
//!
//! A pool of named resources that users lock as a set: a user either gets
//! every resource it asked for or none of them. Waiting users never hold
//! part of their set, so the pool cannot deadlock, and users that get
//! passed over gain priority until nobody may overtake them any more.
//!
//! # Architecture
//!
//! - **Users**: `PoolUser` names the resources locked together
//! - **Lock Manager**: `LockManager` coordinates all users of one pool
//! - **Guards**: RAII-style lock guards for automatic release
//! - **Context**: implicit users bound to a task-local scope
//!
//! # Example
//!
//! ```ignore
//! use respool_core::domain::locking::{LockManager, PoolUser};
//!
//! let manager = LockManager::with_defaults();
//! let philosopher = PoolUser::with_resources("P1", ["F1", "F2"]);
//!
//! manager.lock(&philosopher, Some(Duration::from_secs(5))).await?;
//! // eat...
//! manager.unlock(&philosopher).await;
//! ```

pub mod context;
pub mod event;
pub mod guard;
pub mod manager;
mod registry;
mod resource;
pub mod types;
pub mod user;

// Re-export main types
pub use context::{Context, ContextId};
pub use event::{LockEvent, LockEventType};
pub use guard::PoolGuard;
pub use manager::LockManager;
pub use types::{LockError, LockResult, LockStatus, ResourceName, UserId};
pub use user::PoolUser;
