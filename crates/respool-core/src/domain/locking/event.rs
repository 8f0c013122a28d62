//! Locking domain events
//!
//! Events describing what the pool decided and why. They are meant for
//! diagnostics and workload statistics, not for driving the lock protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::UserId;
use crate::domain::events::DomainEvent;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// All resources were free and granted during `lock`
    LockAcquired,
    /// Resources were granted to a waiting user during another user's `unlock`
    LockHandedOff,
    /// The user had to wait for its resources
    LockContention,
    /// A resource was granted to a user that was not first in line
    PriorityBypass,
    /// An out-of-order grant was refused to protect a longer waiting user
    StarvationGuard,
    /// Held resources were released
    LockReleased,
    /// Claims of a user that never got its lock were withdrawn
    ClaimWithdrawn,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockAcquired => "lock_acquired",
            Self::LockHandedOff => "lock_handed_off",
            Self::LockContention => "lock_contention",
            Self::PriorityBypass => "priority_bypass",
            Self::StarvationGuard => "starvation_guard",
            Self::LockReleased => "lock_released",
            Self::ClaimWithdrawn => "claim_withdrawn",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locking domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// The user the event is about
    pub aggregate_id: Uuid,
    /// Name of that user
    pub user: String,
    /// The resource involved, for per-resource events
    pub resource: Option<String>,
    /// Type of event
    pub event_type: LockEventType,
    /// Event data
    pub data: Option<serde_json::Value>,
    /// When the event occurred
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    /// Create a new lock event
    pub fn new(
        user_id: UserId,
        user: &str,
        resource: Option<String>,
        event_type: LockEventType,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: user_id.as_uuid(),
            user: user.to_string(),
            resource,
            event_type,
            data,
            created_at: Utc::now(),
        }
    }

    /// Create a lock acquired event
    pub fn lock_acquired(user_id: UserId, user: &str, resources: usize) -> Self {
        let data = serde_json::json!({ "resources": resources });
        Self::new(user_id, user, None, LockEventType::LockAcquired, Some(data))
    }

    /// Create a hand-off event
    pub fn lock_handed_off(user_id: UserId, user: &str, priority: u64, bypassed: usize) -> Self {
        let data = serde_json::json!({
            "priority": priority,
            "bypassed": bypassed,
        });
        Self::new(user_id, user, None, LockEventType::LockHandedOff, Some(data))
    }

    /// Create a contention event
    pub fn lock_contention(user_id: UserId, user: &str, resources: usize) -> Self {
        let data = serde_json::json!({ "resources": resources });
        Self::new(user_id, user, None, LockEventType::LockContention, Some(data))
    }

    /// Create a priority bypass event for one resource
    pub fn priority_bypass(user_id: UserId, user: &str, resource: String, priority: u64) -> Self {
        let data = serde_json::json!({ "priority": priority });
        Self::new(
            user_id,
            user,
            Some(resource),
            LockEventType::PriorityBypass,
            Some(data),
        )
    }

    /// Create a starvation guard event
    pub fn starvation_guard(
        user_id: UserId,
        user: &str,
        resource: String,
        priority: u64,
        protected_user: &str,
        protected_priority: u64,
    ) -> Self {
        let data = serde_json::json!({
            "priority": priority,
            "protected_user": protected_user,
            "protected_priority": protected_priority,
        });
        Self::new(
            user_id,
            user,
            Some(resource),
            LockEventType::StarvationGuard,
            Some(data),
        )
    }

    /// Create a lock released event
    pub fn lock_released(user_id: UserId, user: &str, candidates: usize) -> Self {
        let data = serde_json::json!({ "candidates": candidates });
        Self::new(user_id, user, None, LockEventType::LockReleased, Some(data))
    }

    /// Create a claim withdrawn event
    pub fn claim_withdrawn(user_id: UserId, user: &str, candidates: usize) -> Self {
        let data = serde_json::json!({ "candidates": candidates });
        Self::new(user_id, user, None, LockEventType::ClaimWithdrawn, Some(data))
    }
}

impl DomainEvent for LockEvent {
    fn event_type(&self) -> &str {
        self.event_type.as_str()
    }

    fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
}
