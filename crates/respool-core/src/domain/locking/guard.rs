//! Lock guards for RAII-style lock management
//!
//! A guard unlocks its user when dropped, so resources are released even
//! on early returns or panics. Dropping cannot await, so the drop path
//! hands the unlock to the runtime; call [`PoolGuard::release`] to unlock
//! in place.

use super::manager::LockManager;
use super::types::ResourceName;
use super::user::PoolUser;
use std::collections::HashSet;
use std::fmt;
use tokio::runtime::Handle;
use tracing::warn;

/// Proof that a user holds all of its resources
#[derive(Debug)]
pub struct PoolGuard<K: ResourceName> {
    /// Pool the lock was taken from
    manager: LockManager<K>,

    /// The user holding the lock
    user: PoolUser<K>,

    /// Whether the lock has been explicitly released
    released: bool,
}

impl<K: ResourceName> PoolGuard<K> {
    pub(super) fn new(manager: LockManager<K>, user: PoolUser<K>) -> Self {
        Self {
            manager,
            user,
            released: false,
        }
    }

    /// Get the user holding the lock
    pub fn user(&self) -> &PoolUser<K> {
        &self.user
    }

    /// Get the locked resources
    pub fn resources(&self) -> &HashSet<K> {
        self.user.resources()
    }

    /// Unlock now and wait for the unlock to finish
    ///
    /// If this future is dropped before the unlock ran, the guard's drop
    /// still hands the unlock to the runtime.
    pub async fn release(mut self) {
        self.manager.unlock(&self.user).await;
        self.released = true;
    }
}

impl<K: ResourceName> Drop for PoolGuard<K> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                let user = self.user.clone();
                handle.spawn(async move {
                    manager.unlock(&user).await;
                });
            }
            Err(_) => {
                warn!(
                    user = %self.user,
                    "Lock guard dropped outside of a runtime, resources stay locked"
                );
            }
        }
    }
}

impl<K: ResourceName> fmt::Display for PoolGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}:{}]", self.user, self.user.resources().len())
    }
}
