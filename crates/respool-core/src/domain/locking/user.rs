//! Pool users
//!
//! A [`PoolUser`] names the resources it needs up front. The same user can
//! lock and unlock repeatedly, but only one lock episode may be in flight
//! at a time.

use super::types::{ResourceName, UserId};
use std::collections::HashSet;
use std::fmt;

/// A resource user: a name plus the set of resources it locks together
#[derive(Debug, Clone)]
pub struct PoolUser<K> {
    id: UserId,
    name: String,
    resources: HashSet<K>,
}

impl<K: ResourceName> PoolUser<K> {
    /// Create a user without resources
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            name: name.into(),
            resources: HashSet::new(),
        }
    }

    /// Create a user for the given resources
    pub fn with_resources<I>(name: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = K>,
    {
        let mut user = Self::new(name);
        user.set_resources(resources);
        user
    }

    /// Replace the resources used
    ///
    /// Must not be called between a `lock` and its matching `unlock`.
    pub fn set_resources<I>(&mut self, resources: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
    {
        self.resources.clear();
        self.resources.extend(resources);
        self
    }

    /// Add a resource to the set used for the next lock
    pub fn add_resource(&mut self, resource: K) -> &mut Self {
        self.resources.insert(resource);
        self
    }

    /// Get the user ID
    pub fn id(&self) -> UserId {
        self.id
    }

    /// Get the diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the resources this user locks
    pub fn resources(&self) -> &HashSet<K> {
        &self.resources
    }
}

impl<K> fmt::Display for PoolUser<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Per-episode state the pool keeps for an active user
///
/// Created by `lock`, dropped by `unlock`; dropping it is what resets the
/// user for its next episode.
#[derive(Debug)]
pub(crate) struct Claimant<K> {
    pub(crate) name: String,
    /// Resources claimed at lock time. Unlock works from this list only.
    pub(crate) claimed: Vec<K>,
    pub(crate) priority: u64,
    pub(crate) lock_done: bool,
    pub(crate) wait_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl<K> Claimant<K> {
    pub(crate) fn new(name: String, claimed: Vec<K>) -> Self {
        Self {
            name,
            claimed,
            priority: 0,
            lock_done: false,
            wait_tx: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_resources() {
        let mut user = PoolUser::with_resources("P1", ["F1", "F2"]);
        assert_eq!(user.name(), "P1");
        assert_eq!(user.resources().len(), 2);
        assert!(user.resources().contains("F1"));

        user.add_resource("F3").add_resource("F1");
        assert_eq!(user.resources().len(), 3);

        user.set_resources(["F9"]);
        assert_eq!(user.resources().len(), 1);
        assert!(user.resources().contains("F9"));
    }

    #[test]
    fn test_user_identity() {
        let a = PoolUser::<&str>::new("same");
        let b = PoolUser::<&str>::new("same");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_string(), "same");

        // Clones refer to the same pool user
        let c = a.clone();
        assert_eq!(a.id(), c.id());
    }

    #[test]
    fn test_claimant_starts_reset() {
        let claimant = Claimant::new("P1".to_string(), vec!["F1"]);
        assert_eq!(claimant.priority, 0);
        assert!(!claimant.lock_done);
        assert!(claimant.wait_tx.is_none());
    }
}
