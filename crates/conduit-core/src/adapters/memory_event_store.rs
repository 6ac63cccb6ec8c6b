//! # In-Memory Event Store
//!
//! Thread-safe in-memory ledger for tests, development and single-node
//! deployments. Every operation takes one lock acquisition, so admission is
//! a true check-and-insert and transitions validate and write atomically.

use crate::event_store::{
    AdmitOutcome, EventKey, EventQuery, EventState, EventStore, EventStoreError, InboundEvent,
};
use crate::Timestamp;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, error, info};

#[derive(Debug)]
struct StoredEvent {
    /// Admission order, used for newest-first listing
    sequence: u64,
    event: InboundEvent,
}

#[derive(Debug, Default)]
struct Ledger {
    events: HashMap<EventKey, StoredEvent>,
    next_sequence: u64,
}

/// In-memory [`EventStore`].
///
/// # Examples
///
/// ```
/// # tokio_test::block_on(async {
/// use bytes::Bytes;
/// use conduit_core::{AdmitOutcome, EventKey, EventState, EventStore, InMemoryEventStore};
///
/// let store = InMemoryEventStore::new();
/// let key = EventKey::new("user_service", "evt_1");
///
/// let first = store.try_admit(&key, "user.created", Bytes::from_static(b"{}")).await.unwrap();
/// assert!(matches!(first, AdmitOutcome::Admitted));
///
/// let again = store.try_admit(&key, "user.created", Bytes::from_static(b"{}")).await.unwrap();
/// assert!(matches!(again, AdmitOutcome::Duplicate { state: EventState::Received }));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    ledger: Arc<Mutex<Ledger>>,
}

impl InMemoryEventStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the ledger
    pub fn len(&self) -> usize {
        self.lock().map(|l| l.events.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ledger>, EventStoreError> {
        self.ledger.lock().map_err(|e| EventStoreError::Unavailable {
            message: format!("ledger lock poisoned: {}", e),
        })
    }

    /// Validate and apply a forward transition under the ledger lock.
    fn transition(
        &self,
        key: &EventKey,
        to: EventState,
        error: Option<&str>,
    ) -> Result<InboundEvent, EventStoreError> {
        let mut ledger = self.lock()?;
        let stored = ledger
            .events
            .get_mut(key)
            .ok_or_else(|| EventStoreError::NotFound { key: key.clone() })?;
        let event = &mut stored.event;

        if !event.state.can_transition_to(to) {
            error!(
                event_key = %key,
                from = %event.state,
                to = %to,
                "Rejected invalid event state transition"
            );
            return Err(EventStoreError::InvalidTransition {
                key: key.clone(),
                from: event.state,
                to,
            });
        }

        let now = Timestamp::now();
        event.state = to;
        event.updated_at = now;
        if let Some(message) = error {
            event.last_error = Some(message.to_string());
        }
        if to == EventState::Processed {
            event.processed_at = Some(now);
        }

        debug!(event_key = %key, state = %to, "Event state updated");
        Ok(event.clone())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn try_admit(
        &self,
        key: &EventKey,
        event_type: &str,
        raw_payload: Bytes,
    ) -> Result<AdmitOutcome, EventStoreError> {
        let mut ledger = self.lock()?;

        if let Some(existing) = ledger.events.get(key) {
            debug!(event_key = %key, state = %existing.event.state, "Duplicate event delivery");
            return Ok(AdmitOutcome::Duplicate {
                state: existing.event.state,
            });
        }

        let sequence = ledger.next_sequence;
        ledger.next_sequence += 1;
        ledger.events.insert(
            key.clone(),
            StoredEvent {
                sequence,
                event: InboundEvent::admitted(key.clone(), event_type, raw_payload),
            },
        );

        debug!(event_key = %key, event_type = %event_type, "Event admitted");
        Ok(AdmitOutcome::Admitted)
    }

    async fn mark_processing(&self, key: &EventKey) -> Result<InboundEvent, EventStoreError> {
        self.transition(key, EventState::Processing, None)
    }

    async fn mark_processed(&self, key: &EventKey) -> Result<(), EventStoreError> {
        self.transition(key, EventState::Processed, None).map(|_| ())
    }

    async fn mark_failed(&self, key: &EventKey, error: &str) -> Result<(), EventStoreError> {
        self.transition(key, EventState::Failed, Some(error))
            .map(|_| ())
    }

    async fn mark_dead_lettered(
        &self,
        key: &EventKey,
        error: &str,
    ) -> Result<(), EventStoreError> {
        self.transition(key, EventState::DeadLettered, Some(error))
            .map(|_| ())
    }

    async fn increment_attempt(&self, key: &EventKey) -> Result<u32, EventStoreError> {
        let mut ledger = self.lock()?;
        let stored = ledger
            .events
            .get_mut(key)
            .ok_or_else(|| EventStoreError::NotFound { key: key.clone() })?;

        if stored.event.state != EventState::Processing {
            return Err(EventStoreError::InvalidTransition {
                key: key.clone(),
                from: stored.event.state,
                to: EventState::Processing,
            });
        }

        stored.event.attempt_count += 1;
        stored.event.updated_at = Timestamp::now();
        Ok(stored.event.attempt_count)
    }

    async fn get(&self, key: &EventKey) -> Result<Option<InboundEvent>, EventStoreError> {
        let ledger = self.lock()?;
        Ok(ledger.events.get(key).map(|s| s.event.clone()))
    }

    async fn list(&self, query: &EventQuery) -> Result<Vec<InboundEvent>, EventStoreError> {
        let ledger = self.lock()?;
        let mut matching: Vec<&StoredEvent> = ledger
            .events
            .values()
            .filter(|s| query.matches(&s.event))
            .collect();
        matching.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|s| s.event.clone())
            .collect())
    }

    async fn requeue(&self, key: &EventKey) -> Result<InboundEvent, EventStoreError> {
        let mut ledger = self.lock()?;
        let stored = ledger
            .events
            .get_mut(key)
            .ok_or_else(|| EventStoreError::NotFound { key: key.clone() })?;
        let event = &mut stored.event;

        if !event.state.is_redrivable() {
            return Err(EventStoreError::InvalidTransition {
                key: key.clone(),
                from: event.state,
                to: EventState::Received,
            });
        }

        info!(
            event_key = %key,
            from = %event.state,
            attempts = event.attempt_count,
            "Event re-driven by operator"
        );

        event.state = EventState::Received;
        event.attempt_count = 0;
        event.last_error = None;
        event.redrive_count += 1;
        event.updated_at = Timestamp::now();
        Ok(event.clone())
    }
}

#[cfg(test)]
#[path = "memory_event_store_tests.rs"]
mod tests;
