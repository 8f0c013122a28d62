//! Per-resource lock state

use super::types::{LockStatus, UserId};
use std::collections::VecDeque;

/// Availability and claim queue of one named resource
///
/// New claims go to the front of the queue, grants take from the back, so
/// the back is always the oldest claim still waiting.
#[derive(Debug, Clone)]
pub(crate) struct ResourceState {
    pub(crate) available: bool,
    pub(crate) claims: VecDeque<UserId>,
}

impl ResourceState {
    pub(crate) fn new() -> Self {
        Self {
            available: true,
            claims: VecDeque::new(),
        }
    }

    /// Register a new claim as the newest entry
    pub(crate) fn push_claim(&mut self, user: UserId) {
        self.claims.push_front(user);
    }

    /// The oldest waiting claim
    pub(crate) fn tail(&self) -> Option<UserId> {
        self.claims.back().copied()
    }

    pub(crate) fn is_tail(&self, user: UserId) -> bool {
        self.tail() == Some(user)
    }

    /// Remove a claim wherever it sits in the queue
    pub(crate) fn remove_claim(&mut self, user: UserId) -> bool {
        match self.claims.iter().position(|c| *c == user) {
            Some(pos) => {
                self.claims.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Other users queued on this resource
    pub(crate) fn others(&self, user: UserId) -> impl Iterator<Item = UserId> + '_ {
        self.claims.iter().copied().filter(move |c| *c != user)
    }

    /// Nothing holds or wants this resource any more
    pub(crate) fn is_idle(&self) -> bool {
        self.available && self.claims.is_empty()
    }

    pub(crate) fn status(&self) -> LockStatus {
        if !self.available {
            LockStatus::Held
        } else if self.claims.is_empty() {
            LockStatus::Available
        } else {
            LockStatus::Claimed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_queue_order() {
        let mut res = ResourceState::new();
        let first = UserId::new();
        let second = UserId::new();
        let third = UserId::new();

        res.push_claim(first);
        res.push_claim(second);
        res.push_claim(third);

        // Oldest claim sits at the back
        assert_eq!(res.tail(), Some(first));
        assert!(res.is_tail(first));
        assert!(!res.is_tail(third));

        assert!(res.remove_claim(second));
        assert!(!res.remove_claim(second));
        assert_eq!(res.claims.len(), 2);
        assert_eq!(res.others(first).collect::<Vec<_>>(), vec![third]);
    }

    #[test]
    fn test_idle_and_status() {
        let mut res = ResourceState::new();
        assert!(res.is_idle());
        assert_eq!(res.status(), LockStatus::Available);

        let user = UserId::new();
        res.push_claim(user);
        assert!(!res.is_idle());
        assert_eq!(res.status(), LockStatus::Claimed);

        res.claims.pop_back();
        res.available = false;
        assert!(!res.is_idle());
        assert_eq!(res.status(), LockStatus::Held);
    }
}
