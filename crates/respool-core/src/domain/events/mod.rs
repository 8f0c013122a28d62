//! Domain event infrastructure
//!
//! Base trait for domain events plus an in-memory log that records events
//! from a broadcast channel, used for workload statistics and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Base trait for all domain events
///
/// Domain events are immutable facts about something the domain decided.
pub trait DomainEvent: Send + Sync {
    /// Get the event type as a string
    fn event_type(&self) -> &str;

    /// Get the aggregate ID this event belongs to
    fn aggregate_id(&self) -> Uuid;

    /// Get the timestamp when this event occurred
    fn timestamp(&self) -> DateTime<Utc>;

    /// Get optional event data as JSON
    fn data(&self) -> Option<&serde_json::Value>;
}

/// A recorded event, detached from its concrete type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn from_event(event: &dyn DomainEvent) -> Self {
        Self {
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type().to_string(),
            data: event.data().cloned(),
            created_at: event.timestamp(),
        }
    }
}

/// Append-only in-memory event log
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event
    pub fn record(&self, event: &dyn DomainEvent) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredEvent::from_event(event));
    }

    /// Events of one aggregate, oldest first
    pub fn events_for(&self, aggregate_id: Uuid) -> Vec<StoredEvent> {
        self.read(|events| {
            events
                .iter()
                .filter(|e| e.aggregate_id == aggregate_id)
                .cloned()
                .collect()
        })
    }

    /// Number of recorded events of the given type
    pub fn count_of(&self, event_type: &str) -> usize {
        self.read(|events| events.iter().filter(|e| e.event_type == event_type).count())
    }

    /// Event counts keyed by event type
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        self.read(|events| {
            let mut counts = BTreeMap::new();
            for event in events {
                *counts.entry(event.event_type.clone()).or_insert(0) += 1;
            }
            counts
        })
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.read(Vec::len)
    }

    /// Whether no event was stored yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&Vec<StoredEvent>) -> T) -> T {
        f(&self.events.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Record everything arriving on `rx` into `store` until all senders are gone
///
/// The task resolves to the number of events lost because the receiver fell
/// behind the channel capacity.
pub fn spawn_recorder<E>(
    store: Arc<InMemoryEventStore>,
    mut rx: broadcast::Receiver<E>,
) -> JoinHandle<u64>
where
    E: DomainEvent + Clone + 'static,
{
    tokio::spawn(async move {
        let mut missed = 0;
        loop {
            match rx.recv().await {
                Ok(event) => store.record(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event recorder fell behind, events dropped");
                    missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        missed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct TestEvent {
        id: Uuid,
        event_type: &'static str,
        timestamp: DateTime<Utc>,
    }

    impl TestEvent {
        fn new(id: Uuid, event_type: &'static str) -> Self {
            Self {
                id,
                event_type,
                timestamp: Utc::now(),
            }
        }
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &str {
            self.event_type
        }

        fn aggregate_id(&self) -> Uuid {
            self.id
        }

        fn timestamp(&self) -> DateTime<Utc> {
            self.timestamp
        }

        fn data(&self) -> Option<&serde_json::Value> {
            None
        }
    }

    #[test]
    fn test_store_queries() {
        let store = InMemoryEventStore::new();
        let aggregate_id = Uuid::new_v4();

        store.record(&TestEvent::new(aggregate_id, "type_a"));
        store.record(&TestEvent::new(aggregate_id, "type_b"));
        store.record(&TestEvent::new(Uuid::new_v4(), "type_a"));

        assert_eq!(store.len(), 3);
        assert_eq!(store.events_for(aggregate_id).len(), 2);
        assert_eq!(store.count_of("type_a"), 2);

        let counts = store.counts_by_type();
        assert_eq!(counts["type_a"], 2);
        assert_eq!(counts["type_b"], 1);
    }

    #[tokio::test]
    async fn test_recorder_drains_channel() {
        let store = Arc::new(InMemoryEventStore::new());
        let (tx, rx) = broadcast::channel(16);
        let recorder = spawn_recorder(Arc::clone(&store), rx);

        tx.send(TestEvent::new(Uuid::new_v4(), "ping")).unwrap();
        tx.send(TestEvent::new(Uuid::new_v4(), "ping")).unwrap();
        drop(tx);

        assert_eq!(recorder.await.unwrap(), 0);
        assert_eq!(store.count_of("ping"), 2);
    }

    #[tokio::test]
    async fn test_recorder_counts_lagged_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let (tx, rx) = broadcast::channel(2);

        for _ in 0..5 {
            tx.send(TestEvent::new(Uuid::new_v4(), "ping")).unwrap();
        }
        drop(tx);

        let missed = spawn_recorder(Arc::clone(&store), rx).await.unwrap();
        assert_eq!(missed, 3);
        assert_eq!(store.len(), 2);
    }
}
