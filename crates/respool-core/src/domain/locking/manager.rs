//! Lock manager for named resource pools
//!
//! The lock manager hands out all-or-nothing locks over sets of named
//! resources. It handles:
//! - Lazy creation and pruning of resource state
//! - Waiting with timeout or cancellation, with automatic rollback
//! - Hand-off of released resources to waiting users
//! - Cheap introspection for tests and diagnostics
//!
//! All bookkeeping happens inside one fair (FIFO) async mutex. The mutex is
//! never held while a caller waits: waiting happens on a per-user oneshot
//! signal that `unlock` fires after it has granted the resources.

use super::event::LockEvent;
use super::guard::PoolGuard;
use super::registry::{PoolSnapshot, Registration, Registry};
use super::types::{LockError, LockResult, LockStatus, ResourceName};
use super::user::PoolUser;
use crate::config::PoolConfig;
use crate::domain::locking::context::ContextId;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How a wait on the lock signal ended
enum Wait {
    Signalled(Result<(), oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

/// Lock manager for a pool of named resources
///
/// Cloning is cheap and every clone works on the same pool.
#[derive(Debug)]
pub struct LockManager<K: ResourceName> {
    /// Configuration
    config: PoolConfig,

    /// Resource states and active users, guarded by the fair critical section
    registry: Arc<Mutex<Registry<K>>>,

    /// Lock-free view of the registry
    snapshot: Arc<PoolSnapshot<K>>,

    /// Implicit users bound to an execution context
    pub(super) context_users: Arc<std::sync::Mutex<HashMap<ContextId, PoolUser<K>>>>,

    /// Channel for lock events
    events_tx: broadcast::Sender<LockEvent>,
}

impl<K: ResourceName> LockManager<K> {
    /// Create a new lock manager with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let registry = Registry::new();
        let snapshot = registry.snapshot();
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            registry: Arc::new(Mutex::new(registry)),
            snapshot,
            context_users: Arc::new(std::sync::Mutex::new(HashMap::new())),
            events_tx,
        }
    }

    /// Create a lock manager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Subscribe to lock events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events_tx.subscribe()
    }

    /// Lock all resources of `user`
    ///
    /// `None` uses the configured default timeout, which itself defaults to
    /// waiting forever. On error every claim is rolled back and no `unlock`
    /// is needed, although calling it is harmless. On success the call must
    /// be matched by [`unlock`](Self::unlock).
    ///
    /// Dropping the returned future while it waits leaves the user's claims
    /// queued; the caller must then call `unlock` to withdraw them.
    pub async fn lock(&self, user: &PoolUser<K>, timeout: Option<Duration>) -> LockResult<()> {
        self.lock_inner(user, timeout, None).await
    }

    /// Like [`lock`](Self::lock), but gives up when `cancel` fires
    pub async fn lock_with_cancel(
        &self,
        user: &PoolUser<K>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<()> {
        self.lock_inner(user, timeout, Some(cancel)).await
    }

    pub(super) async fn lock_inner(
        &self,
        user: &PoolUser<K>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> LockResult<()> {
        let timeout = timeout.or_else(|| self.config.default_timeout());

        let registration = {
            let mut registry = self.registry.lock().await;
            let registration = registry.register(user);
            let events = registry.take_events();
            drop(registry);
            self.publish(events);
            registration?
        };

        match registration {
            Registration::Granted => {
                debug!(user = %user, "Lock acquired");
                Ok(())
            }
            Registration::Waiting(rx) => {
                debug!(
                    user = %user,
                    timeout_ms = timeout.map(|t| t.as_millis() as u64),
                    "Waiting for lock"
                );
                self.wait_for_lock(user, rx, timeout, cancel).await
            }
        }
    }

    /// Wait for the remaining resources, handed out by `unlock`
    async fn wait_for_lock(
        &self,
        user: &PoolUser<K>,
        rx: oneshot::Receiver<()>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> LockResult<()> {
        let start = Instant::now();
        let signal = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
                None => Some(rx.await),
            }
        };

        let outcome = match cancel {
            Some(token) => tokio::select! {
                signalled = signal => signalled.map_or(Wait::TimedOut, Wait::Signalled),
                () = token.cancelled() => Wait::Cancelled,
            },
            None => signal.await.map_or(Wait::TimedOut, Wait::Signalled),
        };

        match outcome {
            Wait::Signalled(Ok(())) => {
                let granted = self.registry.lock().await.holds(user.id());
                if granted {
                    debug!(
                        user = %user,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "Lock handed off"
                    );
                    Ok(())
                } else {
                    self.consistency_violation(user).await
                }
            }
            Wait::Signalled(Err(_)) => self.consistency_violation(user).await,
            Wait::TimedOut => {
                let err = LockError::Timeout {
                    user: user.name().to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                };
                self.abandon(user, err).await
            }
            Wait::Cancelled => {
                let err = LockError::Cancelled {
                    user: user.name().to_string(),
                };
                self.abandon(user, err).await
            }
        }
    }

    /// Give up waiting, unless the lock was granted in the meantime
    async fn abandon(&self, user: &PoolUser<K>, err: LockError) -> LockResult<()> {
        let mut registry = self.registry.lock().await;
        if registry.holds(user.id()) {
            debug!(user = %user, "Lock granted while giving up, keeping it");
            return Ok(());
        }
        registry.release(user.id());
        let events = registry.take_events();
        drop(registry);
        self.publish(events);

        debug!(user = %user, error = %err, "Lock attempt rolled back");
        Err(err)
    }

    /// The wait ended without the lock being granted
    ///
    /// The wait signal is only fired after the grant is complete, so this
    /// means the user's registration was removed underneath the waiter (for
    /// example by an `unlock` of the same user from another task).
    async fn consistency_violation(&self, user: &PoolUser<K>) -> LockResult<()> {
        error!(
            user = %user,
            "Pool inconsistent: woken up without holding the lock, rolling back"
        );
        let mut registry = self.registry.lock().await;
        registry.release(user.id());
        let events = registry.take_events();
        drop(registry);
        self.publish(events);

        Err(LockError::ConsistencyViolation {
            user: user.name().to_string(),
        })
    }

    /// Release the resources of `user`, or withdraw its pending claims
    ///
    /// Safe to call more than once; unlocking a user that is not registered
    /// only logs a warning.
    pub async fn unlock(&self, user: &PoolUser<K>) {
        let mut registry = self.registry.lock().await;
        let Some(release) = registry.release(user.id()) else {
            drop(registry);
            warn!(user = %user, "Cannot unlock resources, user holds no lock");
            return;
        };
        let events = registry.take_events();
        drop(registry);
        self.publish(events);

        debug!(
            user = %user,
            had_lock = release.had_lock,
            handed_off = release.granted.len(),
            "Unlocked"
        );
    }

    /// Lock the resources of `user` and return a guard that unlocks on drop
    pub async fn acquire(
        &self,
        user: PoolUser<K>,
        timeout: Option<Duration>,
    ) -> LockResult<PoolGuard<K>> {
        self.lock(&user, timeout).await?;
        Ok(PoolGuard::new(self.clone(), user))
    }

    /// Lock, run `f`, and unlock again
    ///
    /// The unlock also happens if `f` panics or its future is dropped.
    pub async fn with_lock<F, Fut, T>(
        &self,
        user: &PoolUser<K>,
        timeout: Option<Duration>,
        f: F,
    ) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(user.clone(), timeout).await?;
        let output = f().await;
        guard.release().await;
        Ok(output)
    }

    // ========== Introspection ==========

    /// Whether the named resource is currently held. Cheap.
    pub fn is_locked<Q>(&self, name: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.snapshot.is_held(name)
    }

    /// Whether no resource is held at all
    pub fn is_all_unlocked(&self) -> bool {
        self.snapshot.none_held()
    }

    /// Number of users registered with the pool (waiting or holding)
    ///
    /// Zero once all users are done; anything else means a missing `unlock`.
    pub fn active_user_count(&self) -> usize {
        self.snapshot.active_users()
    }

    /// Number of resources the pool currently tracks
    pub fn resource_count(&self) -> usize {
        self.snapshot.resources()
    }

    /// Number of implicit users bound to an execution context
    pub fn context_user_count(&self) -> usize {
        self.context_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of users queued for the named resource
    ///
    /// Takes the critical section, so this is an expensive call meant for
    /// diagnostics only.
    pub async fn queue_length<Q>(&self, name: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.registry.lock().await.queue_length(name)
    }

    /// Status of the named resource. Takes the critical section.
    pub async fn status<Q>(&self, name: &Q) -> LockStatus
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.registry.lock().await.status(name)
    }

    /// Whether `user` currently holds its lock
    pub async fn holds(&self, user: &PoolUser<K>) -> bool {
        self.registry.lock().await.holds(user.id())
    }

    /// Current starvation priority of `user`, `None` if it is not registered
    pub async fn priority(&self, user: &PoolUser<K>) -> Option<u64> {
        self.registry.lock().await.priority(user.id())
    }

    // ========== Internal Methods ==========

    fn publish(&self, events: Vec<LockEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events_tx.send(event);
        }
    }
}

impl<K: ResourceName> Clone for LockManager<K> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            snapshot: Arc::clone(&self.snapshot),
            context_users: Arc::clone(&self.context_users),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<K: ResourceName> Default for LockManager<K> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::event::LockEventType;

    fn user(name: &str, resources: &[&'static str]) -> PoolUser<&'static str> {
        PoolUser::with_resources(name, resources.iter().copied())
    }

    fn assert_pool_empty(manager: &LockManager<&'static str>) {
        assert!(manager.is_all_unlocked());
        assert_eq!(manager.active_user_count(), 0);
        assert_eq!(manager.resource_count(), 0);
        assert_eq!(manager.context_user_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1", "R2"]);

        manager.lock(&x, None).await.expect("lock");
        assert!(manager.is_locked("R1"));
        assert!(manager.is_locked("R2"));
        assert!(!manager.is_locked("R3"));
        assert!(!manager.is_all_unlocked());
        assert!(manager.holds(&x).await);
        assert_eq!(manager.active_user_count(), 1);
        assert_eq!(manager.resource_count(), 2);

        manager.unlock(&x).await;
        assert!(!manager.holds(&x).await);
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_reentrant_lock_rejected() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1"]);

        manager.lock(&x, None).await.unwrap();
        let err = manager.lock(&x, None).await.unwrap_err();
        assert!(matches!(err, LockError::ReentrantUse { .. }));
        assert_eq!(manager.queue_length("R1").await, 0);

        manager.unlock(&x).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_double_unlock_is_harmless() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1"]);

        manager.lock(&x, None).await.unwrap();
        manager.unlock(&x).await;
        manager.unlock(&x).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_claims() {
        let manager = LockManager::with_defaults();
        let holder = user("holder", &["R1"]);
        let waiter = user("waiter", &["R1", "R2"]);

        manager.lock(&holder, None).await.unwrap();
        let err = manager
            .lock(&waiter, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));

        assert_eq!(manager.queue_length("R1").await, 0);
        assert_eq!(manager.queue_length("R2").await, 0);
        assert_eq!(manager.active_user_count(), 1);
        assert_eq!(manager.resource_count(), 1);

        manager.unlock(&holder).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_default_timeout_from_config() {
        let config = PoolConfig::default().with_timeout(Duration::from_millis(10));
        let manager = LockManager::new(config);
        let holder = user("holder", &["R1"]);
        let waiter = user("waiter", &["R1"]);

        manager.lock(&holder, None).await.unwrap();
        let err = manager.lock(&waiter, None).await.unwrap_err();
        assert_eq!(err.code(), "E300");

        manager.unlock(&holder).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_cancel_rolls_back_claims() {
        let manager = LockManager::with_defaults();
        let holder = user("holder", &["R1"]);
        let waiter = user("waiter", &["R1"]);
        let token = CancellationToken::new();

        manager.lock(&holder, None).await.unwrap();
        token.cancel();
        let err = manager
            .lock_with_cancel(&waiter, None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled { .. }));
        assert_eq!(manager.queue_length("R1").await, 0);

        manager.unlock(&holder).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_hand_off_wakes_waiter() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1"]);
        let y = user("Y", &["R1"]);

        manager.lock(&x, None).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            let y = y.clone();
            tokio::spawn(async move { manager.lock(&y, None).await })
        };

        while manager.queue_length("R1").await == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!manager.holds(&y).await);

        manager.unlock(&x).await;
        waiter.await.unwrap().expect("handed off");
        assert!(manager.holds(&y).await);
        assert!(manager.is_locked("R1"));

        manager.unlock(&y).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_unlock_from_other_task_is_reported() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1"]);
        let y = user("Y", &["R1"]);

        manager.lock(&x, None).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            let y = y.clone();
            tokio::spawn(async move { manager.lock(&y, None).await })
        };
        while manager.queue_length("R1").await == 0 {
            tokio::task::yield_now().await;
        }

        // Misuse: someone else unlocks Y while Y is still waiting
        manager.unlock(&y).await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::ConsistencyViolation { .. }));

        manager.unlock(&x).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_with_lock_unlocks_afterwards() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1", "R2"]);

        let locked_inside = manager
            .with_lock(&x, None, || async { manager.is_locked("R2") })
            .await
            .unwrap();
        assert!(locked_inside);
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_grant_during_cancel_is_kept() {
        let manager = LockManager::with_defaults();
        let holder = user("holder", &["R1"]);
        let waiter = user("waiter", &["R1"]);
        let token = CancellationToken::new();

        manager.lock(&holder, None).await.unwrap();
        let pending = {
            let manager = manager.clone();
            let waiter = waiter.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.lock_with_cancel(&waiter, None, &token).await })
        };
        while manager.queue_length("R1").await == 0 {
            tokio::task::yield_now().await;
        }

        // The waiter gives up but cannot roll back until the section is free
        let mut registry = manager.registry.lock().await;
        token.cancel();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        registry.release(holder.id());
        let events = registry.take_events();
        drop(registry);
        manager.publish(events);

        pending.await.unwrap().expect("grant kept");
        assert!(manager.holds(&waiter).await);
        assert!(manager.is_locked("R1"));

        manager.unlock(&waiter).await;
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_dropped_release_still_unlocks() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1"]);

        let guard = manager.acquire(x.clone(), None).await.unwrap();
        let registry = manager.registry.lock().await;
        let released = tokio::time::timeout(Duration::from_millis(10), guard.release()).await;
        assert!(released.is_err());
        drop(registry);

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.active_user_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("unlock after dropped release");
        assert!(!manager.holds(&x).await);
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_dropped_with_lock_still_unlocks() {
        let manager = LockManager::with_defaults();
        let x = user("X", &["R1"]);

        let parked = manager.with_lock(&x, None, || std::future::pending::<()>());
        assert!(
            tokio::time::timeout(Duration::from_millis(10), parked)
                .await
                .is_err()
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.is_all_unlocked() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("unlock after dropped with_lock");
        assert_pool_empty(&manager);
    }

    #[tokio::test]
    async fn test_events_published() {
        let manager = LockManager::with_defaults();
        let mut events = manager.subscribe();
        let x = user("X", &["R1"]);

        manager.lock(&x, None).await.unwrap();
        manager.unlock(&x).await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.event_type, LockEventType::LockAcquired);
        assert_eq!(first.user, "X");
        let second = events.recv().await.unwrap();
        assert_eq!(second.event_type, LockEventType::LockReleased);
    }

    #[tokio::test]
    async fn test_status_reports_queue_state() {
        let manager = LockManager::with_defaults();
        assert_eq!(manager.status("R1").await, LockStatus::Available);

        let x = user("X", &["R1"]);
        manager.lock(&x, None).await.unwrap();
        assert_eq!(manager.status("R1").await, LockStatus::Held);

        manager.unlock(&x).await;
        assert_eq!(manager.status("R1").await, LockStatus::Available);
    }
}
