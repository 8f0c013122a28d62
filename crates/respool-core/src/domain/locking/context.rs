//! Context-bound locking
//!
//! Convenience API for callers that do not want to manage [`PoolUser`]
//! values themselves. Inside a [`scope`], the pool keeps one implicit user
//! per execution context, created by [`LockManager::lock_names`] and
//! removed again by [`LockManager::unlock_context`].
//!
//! The context is a tokio task-local value. A task spawned from inside a
//! scope does not inherit it and needs its own scope.
//!
//! ```ignore
//! use respool_core::context;
//!
//! context::scope_named("P1", async {
//!     pool.lock_names(["F1", "F2"], None).await?;
//!     // eat
//!     pool.unlock_context().await;
//!     Ok::<_, LockError>(())
//! })
//! .await?;
//! ```

use super::manager::LockManager;
use super::types::{LockError, LockResult, ResourceName};
use super::user::PoolUser;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::sync::PoisonError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: Context;
}

/// Identity of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Create a new random context ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The execution context a future runs in
#[derive(Debug, Clone)]
pub struct Context {
    id: ContextId,
    name: String,
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Name used for the implicit pool user
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The context of the running task, if it runs inside a scope
pub fn current() -> Option<Context> {
    CURRENT.try_with(Context::clone).ok()
}

/// Run `future` in a fresh, anonymous context
pub async fn scope<F: Future>(future: F) -> F::Output {
    let id = ContextId::new();
    let name = format!("context-{}", &id.to_string()[..8]);
    CURRENT.scope(Context { id, name }, future).await
}

/// Run `future` in a fresh context named `name`
pub async fn scope_named<F: Future>(name: impl Into<String>, future: F) -> F::Output {
    let context = Context {
        id: ContextId::new(),
        name: name.into(),
    };
    CURRENT.scope(context, future).await
}

impl<K: ResourceName> LockManager<K> {
    /// Lock `names` on behalf of the current context
    ///
    /// Fails with [`LockError::NoContext`] outside a [`scope`] and with
    /// [`LockError::ReentrantUse`] if the context already holds or waits
    /// for a lock. On any failure the context is left unbound.
    pub async fn lock_names<I>(&self, names: I, timeout: Option<Duration>) -> LockResult<()>
    where
        I: IntoIterator<Item = K>,
    {
        self.lock_names_inner(names, timeout, None).await
    }

    /// Like [`lock_names`](Self::lock_names), but gives up when `cancel` fires
    pub async fn lock_names_with_cancel<I>(
        &self,
        names: I,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<()>
    where
        I: IntoIterator<Item = K>,
    {
        self.lock_names_inner(names, timeout, Some(cancel)).await
    }

    async fn lock_names_inner<I>(
        &self,
        names: I,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> LockResult<()>
    where
        I: IntoIterator<Item = K>,
    {
        let context = current().ok_or(LockError::NoContext)?;
        let user = PoolUser::with_resources(context.name(), names);

        {
            let mut bound = self
                .context_users
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match bound.entry(context.id()) {
                Entry::Occupied(_) => {
                    return Err(LockError::ReentrantUse {
                        user: context.name().to_string(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(user.clone());
                }
            }
        }

        let result = self.lock_inner(&user, timeout, cancel).await;
        if result.is_err() {
            self.unbind(context.id());
        }
        result
    }

    /// Unlock whatever the current context locked with `lock_names`
    pub async fn unlock_context(&self) {
        let Some(context) = current() else {
            warn!("Cannot unlock context resources outside of a context scope");
            return;
        };

        match self.unbind(context.id()) {
            Some(user) => self.unlock(&user).await,
            None => warn!(context = %context.name(), "No resources locked by this context"),
        }
    }

    fn unbind(&self, id: ContextId) -> Option<PoolUser<K>> {
        self.context_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}
