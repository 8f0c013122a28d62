//! Resource registry and the grant algorithms
//!
//! Everything in here runs inside the pool's critical section. Nothing
//! blocks and nothing awaits: the registry only does bookkeeping and hands
//! back wait signals for the caller to suspend on after the section is
//! released.
//!
//! Two grant paths exist:
//! - `try_lock_all` runs during `lock` when every resource is free. It backs
//!   off if any other queued user already has priority, so fresh requests do
//!   not keep overtaking users that were made to wait before.
//! - `try_lock_all_available` runs during `unlock` for each promotion
//!   candidate. A candidate may be granted a resource on which it is not
//!   first in line (this breaks transitive waits, e.g. P2 waiting on P1
//!   while P3 waits on P2), unless someone else queued there has a higher
//!   priority. Every skipped user gets its priority bumped, which makes
//!   repeated skipping self-limiting.

use super::event::LockEvent;
use super::resource::ResourceState;
use super::types::{LockError, LockResult, LockStatus, ResourceName, UserId};
use super::user::{Claimant, PoolUser};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome of registering a lock request
#[derive(Debug)]
pub(crate) enum Registration {
    /// All resources were granted right away
    Granted,
    /// The caller has to wait on this signal
    Waiting(oneshot::Receiver<()>),
}

/// Outcome of releasing a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Release {
    /// The user held its resources (as opposed to only waiting for them)
    pub(crate) had_lock: bool,
    /// Waiting users that were granted their lock by this release
    pub(crate) granted: Vec<UserId>,
}

/// Lock-free view of the registry for cheap introspection
///
/// Written only from inside the critical section, read from anywhere.
#[derive(Debug)]
pub(crate) struct PoolSnapshot<K> {
    held: RwLock<HashSet<K>>,
    active_users: AtomicUsize,
    resources: AtomicUsize,
}

impl<K: ResourceName> PoolSnapshot<K> {
    fn new() -> Self {
        Self {
            held: RwLock::new(HashSet::new()),
            active_users: AtomicUsize::new(0),
            resources: AtomicUsize::new(0),
        }
    }

    fn set_held(&self, name: &K, held: bool) {
        let mut set = self.held.write().unwrap_or_else(PoisonError::into_inner);
        if held {
            set.insert(name.clone());
        } else {
            set.remove(name);
        }
    }

    fn record_counts(&self, active_users: usize, resources: usize) {
        self.active_users.store(active_users, Ordering::Release);
        self.resources.store(resources, Ordering::Release);
    }

    pub(crate) fn is_held<Q>(&self, name: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.held
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    pub(crate) fn none_held(&self) -> bool {
        self.held
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub(crate) fn active_users(&self) -> usize {
        self.active_users.load(Ordering::Acquire)
    }

    pub(crate) fn resources(&self) -> usize {
        self.resources.load(Ordering::Acquire)
    }
}

/// Resource states and active users of one pool
#[derive(Debug)]
pub(crate) struct Registry<K> {
    resources: HashMap<K, ResourceState>,
    users: HashMap<UserId, Claimant<K>>,
    events: Vec<LockEvent>,
    snapshot: Arc<PoolSnapshot<K>>,
}

impl<K: ResourceName> Registry<K> {
    pub(crate) fn new() -> Self {
        Self {
            resources: HashMap::new(),
            users: HashMap::new(),
            events: Vec::new(),
            snapshot: Arc::new(PoolSnapshot::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<PoolSnapshot<K>> {
        Arc::clone(&self.snapshot)
    }

    pub(crate) fn is_active(&self, id: UserId) -> bool {
        self.users.contains_key(&id)
    }

    pub(crate) fn holds(&self, id: UserId) -> bool {
        self.users.get(&id).is_some_and(|c| c.lock_done)
    }

    pub(crate) fn priority(&self, id: UserId) -> Option<u64> {
        self.users.get(&id).map(|c| c.priority)
    }

    pub(crate) fn queue_length<Q>(&self, name: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.resources.get(name).map_or(0, |r| r.claims.len())
    }

    pub(crate) fn status<Q>(&self, name: &Q) -> LockStatus
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.resources
            .get(name)
            .map_or(LockStatus::Available, ResourceState::status)
    }

    /// Drain the events recorded since the last call
    pub(crate) fn take_events(&mut self) -> Vec<LockEvent> {
        std::mem::take(&mut self.events)
    }

    fn priority_of(&self, id: UserId) -> u64 {
        self.users.get(&id).map_or(0, |c| c.priority)
    }

    fn name_of(&self, id: UserId) -> &str {
        self.users.get(&id).map_or("<gone>", |c| c.name.as_str())
    }

    fn sync_counts(&self) {
        self.snapshot
            .record_counts(self.users.len(), self.resources.len());
    }

    /// Claim every resource of `user` and grant them if possible
    pub(crate) fn register(&mut self, user: &PoolUser<K>) -> LockResult<Registration> {
        let id = user.id();
        if user.resources().is_empty() {
            return Err(LockError::NoResources {
                user: user.name().to_string(),
            });
        }
        if self.users.contains_key(&id) {
            return Err(LockError::ReentrantUse {
                user: user.name().to_string(),
            });
        }

        let claimed: Vec<K> = user.resources().iter().cloned().collect();
        let mut all_available = true;
        for name in &claimed {
            let res = self
                .resources
                .entry(name.clone())
                .or_insert_with(ResourceState::new);
            res.push_claim(id);
            all_available &= res.available;
        }
        let count = claimed.len();
        self.users
            .insert(id, Claimant::new(user.name().to_string(), claimed));

        if all_available && self.try_lock_all(id) {
            self.events
                .push(LockEvent::lock_acquired(id, user.name(), count));
            self.sync_counts();
            return Ok(Registration::Granted);
        }

        let (tx, rx) = oneshot::channel();
        if let Some(claimant) = self.users.get_mut(&id) {
            claimant.wait_tx = Some(tx);
        }
        self.events
            .push(LockEvent::lock_contention(id, user.name(), count));
        self.sync_counts();
        Ok(Registration::Waiting(rx))
    }

    /// Grant all resources of a user that found them all available
    fn try_lock_all(&mut self, id: UserId) -> bool {
        let Some(claimant) = self.users.get(&id) else {
            return false;
        };

        for name in &claimant.claimed {
            let Some(res) = self.resources.get(name) else {
                continue;
            };
            if let Some(waiter) = res.others(id).find(|other| self.priority_of(*other) > 0) {
                debug!(
                    user = %claimant.name,
                    waiter = %self.name_of(waiter),
                    resource = %name,
                    "Deferring to waiting user with priority"
                );
                return false;
            }
        }

        let claimed = claimant.claimed.clone();
        for name in &claimed {
            let Some(res) = self.resources.get_mut(name) else {
                continue;
            };
            res.remove_claim(id);
            res.available = false;
            for other in &res.claims {
                if let Some(waiter) = self.users.get_mut(other) {
                    waiter.priority += 1;
                }
            }
            self.snapshot.set_held(name, true);
        }

        if let Some(claimant) = self.users.get_mut(&id) {
            claimant.lock_done = true;
        }
        true
    }

    /// Hand resources to a waiting user after a release
    ///
    /// All that is known for sure is that the candidate is first in line for
    /// at least one resource.
    fn try_lock_all_available(&mut self, id: UserId) -> bool {
        let Some(candidate) = self.users.get(&id) else {
            return false;
        };
        if candidate.lock_done {
            return false;
        }
        if !candidate
            .claimed
            .iter()
            .all(|name| self.resources.get(name).is_some_and(|r| r.available))
        {
            return false;
        }

        let priority = candidate.priority;
        let mut blocker = None;
        'scan: for name in &candidate.claimed {
            let Some(res) = self.resources.get(name) else {
                continue;
            };
            if res.is_tail(id) {
                continue;
            }
            for other in res.others(id) {
                let other_priority = self.priority_of(other);
                if other_priority > priority {
                    blocker = Some((name.clone(), other, other_priority));
                    break 'scan;
                }
            }
        }

        let user = candidate.name.clone();
        let claimed = candidate.claimed.clone();
        if let Some((name, other, other_priority)) = blocker {
            let protected = self.name_of(other).to_string();
            debug!(
                user = %user,
                priority,
                over = %protected,
                over_priority = other_priority,
                resource = %name,
                "Not prioritizing lock"
            );
            self.events.push(LockEvent::starvation_guard(
                id,
                &user,
                name.to_string(),
                priority,
                &protected,
                other_priority,
            ));
            return false;
        }

        let mut bypassed = 0;
        for name in &claimed {
            let Some(res) = self.resources.get_mut(name) else {
                continue;
            };
            if res.is_tail(id) {
                res.claims.pop_back();
            } else {
                debug!(user = %user, priority, resource = %name, "Prioritizing lock");
                res.remove_claim(id);
                for other in &res.claims {
                    if let Some(waiter) = self.users.get_mut(other) {
                        waiter.priority += 1;
                    }
                }
                bypassed += 1;
                self.events.push(LockEvent::priority_bypass(
                    id,
                    &user,
                    name.to_string(),
                    priority,
                ));
            }
            res.available = false;
            self.snapshot.set_held(name, true);
        }

        if let Some(candidate) = self.users.get_mut(&id) {
            candidate.lock_done = true;
            let delivered = candidate
                .wait_tx
                .take()
                .is_some_and(|tx| tx.send(()).is_ok());
            if !delivered {
                warn!(
                    user = %user,
                    "Waiter is gone, resources stay locked until the user is unlocked"
                );
            }
        }
        self.events
            .push(LockEvent::lock_handed_off(id, &user, priority, bypassed));
        true
    }

    /// Release held resources or withdraw pending claims of a user
    ///
    /// Returns `None` if the user is not active.
    pub(crate) fn release(&mut self, id: UserId) -> Option<Release> {
        let claimant = self.users.remove(&id)?;
        let had_lock = claimant.lock_done;

        let mut candidates = Vec::new();
        for name in &claimant.claimed {
            let Some(res) = self.resources.get_mut(name) else {
                continue;
            };
            if had_lock {
                res.available = true;
                self.snapshot.set_held(name, false);
                candidates.extend(res.tail());
            } else if res.is_tail(id) {
                res.claims.pop_back();
                if res.available {
                    candidates.extend(res.tail());
                }
            } else {
                // Newer claims may have been pushed in front of ours
                res.remove_claim(id);
            }
        }

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(*c));

        let mut granted = Vec::new();
        for candidate in &candidates {
            if self.try_lock_all_available(*candidate) {
                granted.push(*candidate);
            }
        }

        for name in &claimant.claimed {
            if self.resources.get(name).is_some_and(ResourceState::is_idle) {
                self.resources.remove(name);
            }
        }

        let event = if had_lock {
            LockEvent::lock_released(id, &claimant.name, candidates.len())
        } else {
            LockEvent::claim_withdrawn(id, &claimant.name, candidates.len())
        };
        self.events.push(event);
        self.sync_counts();

        Some(Release { had_lock, granted })
    }
}
