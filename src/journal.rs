//! The durable log contract and its in-memory backend.
//!
//! An [`EventJournal`] appends a batch of events for one entity identity
//! atomically (all or nothing) and reads the identity's history back in a
//! stable total order. The file-backed implementation lives in
//! [`storage`](crate::storage).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EventSourcedEntity;
use crate::error::StorageError;

/// Boxed, `Send` future returned by [`EventJournal`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Fixed namespace UUID for deterministic stream ID derivation.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9a, 0x1e, 0x7c, 0x3b, 0x4d, 0x2f, 0x4a, 0x8e, 0xb5, 0x6c, 0x1f, 0x3d, 0x7e, 0x9a, 0x0b, 0xc4,
]);

/// Stable identity of one entity's history: its type plus its id within
/// that type.
///
/// # Examples
///
/// ```
/// use eventfold_effects::PersistenceId;
///
/// let id = PersistenceId::new("account", "acc-1");
/// assert_eq!(id.to_string(), "account|acc-1");
/// assert_eq!(id.stream_uuid(), PersistenceId::new("account", "acc-1").stream_uuid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistenceId {
    entity_type: String,
    entity_id: String,
}

impl PersistenceId {
    /// Build an id from an entity type name and an entity id.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Build an id for entity type `E`.
    pub fn of<E: EventSourcedEntity>(entity_id: impl Into<String>) -> Self {
        Self::new(E::ENTITY_TYPE, entity_id)
    }

    /// The entity type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The id within the entity type.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Deterministic UUID v5 for this identity.
    ///
    /// The same identity always maps to the same UUID, regardless of which
    /// process performs the mapping.
    pub fn stream_uuid(&self) -> Uuid {
        let name = format!("{}/{}", self.entity_type, self.entity_id);
        Uuid::new_v5(&STREAM_NAMESPACE, name.as_bytes())
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.entity_type, self.entity_id)
    }
}

/// An event as recorded in an entity's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent<Ev> {
    /// Position in the identity's history, 1-based and gap-free.
    pub sequence_nr: u64,
    /// Unique id assigned at append time.
    pub event_id: Uuid,
    /// The domain event.
    pub event: Ev,
}

impl<Ev> StoredEvent<Ev> {
    pub(crate) fn new(sequence_nr: u64, event: Ev) -> Self {
        Self {
            sequence_nr,
            event_id: Uuid::new_v4(),
            event,
        }
    }
}

/// Durable, append-only, per-identity event log.
///
/// # Contract
///
/// - [`append_atomic`](EventJournal::append_atomic) makes every event of
///   the batch durable, in slice order, or none of them. On error the
///   history is unchanged.
/// - [`read_events`](EventJournal::read_events) returns the identity's
///   history in append order. An identity with no history yields an empty
///   vector.
pub trait EventJournal<Ev>: Send + Sync + 'static {
    /// Append `events` as one atomic unit.
    ///
    /// Returns the sequence number of the last event in the history after
    /// the append.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the batch could not be made durable.
    fn append_atomic<'a>(
        &'a self,
        id: &'a PersistenceId,
        events: &'a [Ev],
    ) -> BoxFuture<'a, Result<u64, StorageError>>;

    /// Read the full history of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the history cannot be read or decoded.
    fn read_events<'a>(
        &'a self,
        id: &'a PersistenceId,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent<Ev>>, StorageError>>;
}

struct MemoryInner<Ev> {
    streams: HashMap<PersistenceId, Vec<StoredEvent<Ev>>>,
    /// Fail the next append after staging this many of its events.
    fail_next: Option<usize>,
}

/// Process-local [`EventJournal`].
///
/// Cheap to clone; clones share the same histories. Supports failure
/// injection through [`fail_next_append`](InMemoryJournal::fail_next_append).
pub struct InMemoryJournal<Ev> {
    inner: Arc<Mutex<MemoryInner<Ev>>>,
}

impl<Ev> Clone for InMemoryJournal<Ev> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Ev> Default for InMemoryJournal<Ev> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                streams: HashMap::new(),
                fail_next: None,
            })),
        }
    }
}

impl<Ev> fmt::Debug for InMemoryJournal<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryJournal")
            .field("streams", &inner.streams.len())
            .finish()
    }
}

impl<Ev: Clone> InMemoryJournal<Ev> {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next append fail after `after` of its events have been
    /// staged. None of the staged events become visible.
    pub fn fail_next_append(&self, after: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.fail_next = Some(after);
    }

    /// The domain events recorded for `id`, in order.
    pub fn events(&self, id: &PersistenceId) -> Vec<Ev> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .streams
            .get(id)
            .map(|stream| stream.iter().map(|stored| stored.event.clone()).collect())
            .unwrap_or_default()
    }

    fn append_now(&self, id: &PersistenceId, events: &[Ev]) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let fail_after = inner.fail_next.take();
        let last = inner.streams.get(id).map_or(0, |s| s.len() as u64);

        let mut staged = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            if fail_after == Some(offset) {
                return Err(StorageError::Unavailable(format!(
                    "injected failure after {offset} of {} events",
                    events.len()
                )));
            }
            staged.push(StoredEvent::new(last + offset as u64 + 1, event.clone()));
        }
        if let Some(after) = fail_after {
            return Err(StorageError::Unavailable(format!(
                "injected failure after {after} of {} events",
                events.len()
            )));
        }

        let stream = inner.streams.entry(id.clone()).or_default();
        stream.extend(staged);
        Ok(stream.len() as u64)
    }

    fn read_now(&self, id: &PersistenceId) -> Vec<StoredEvent<Ev>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.streams.get(id).cloned().unwrap_or_default()
    }
}

impl<Ev: Clone + Send + Sync + 'static> EventJournal<Ev> for InMemoryJournal<Ev> {
    fn append_atomic<'a>(
        &'a self,
        id: &'a PersistenceId,
        events: &'a [Ev],
    ) -> BoxFuture<'a, Result<u64, StorageError>> {
        Box::pin(std::future::ready(self.append_now(id, events)))
    }

    fn read_events<'a>(
        &'a self,
        id: &'a PersistenceId,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent<Ev>>, StorageError>> {
        Box::pin(std::future::ready(Ok(self.read_now(id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> PersistenceId {
        PersistenceId::new("counter", "c-1")
    }

    #[test]
    fn stream_uuid_is_deterministic() {
        assert_eq!(id().stream_uuid(), id().stream_uuid());
    }

    #[test]
    fn stream_uuid_differs_by_entity_id() {
        assert_ne!(
            PersistenceId::new("counter", "c-1").stream_uuid(),
            PersistenceId::new("counter", "c-2").stream_uuid()
        );
    }

    #[test]
    fn stream_uuid_differs_by_entity_type() {
        assert_ne!(
            PersistenceId::new("counter", "x").stream_uuid(),
            PersistenceId::new("account", "x").stream_uuid()
        );
    }

    #[test]
    fn display_joins_type_and_id() {
        assert_eq!(id().to_string(), "counter|c-1");
        assert_eq!(id().entity_type(), "counter");
        assert_eq!(id().entity_id(), "c-1");
    }

    #[tokio::test]
    async fn append_assigns_gap_free_sequence_numbers() {
        let journal = InMemoryJournal::new();
        assert_eq!(journal.append_atomic(&id(), &["a", "b"]).await.unwrap(), 2);
        assert_eq!(journal.append_atomic(&id(), &["c"]).await.unwrap(), 3);

        let stored = journal.read_events(&id()).await.unwrap();
        let seqs: Vec<u64> = stored.iter().map(|s| s.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(journal.events(&id()), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn histories_are_per_identity() {
        let journal = InMemoryJournal::new();
        let other = PersistenceId::new("counter", "c-2");
        journal.append_atomic(&id(), &[1]).await.unwrap();
        journal.append_atomic(&other, &[2, 3]).await.unwrap();
        assert_eq!(journal.events(&id()), vec![1]);
        assert_eq!(journal.events(&other), vec![2, 3]);
    }

    #[tokio::test]
    async fn unknown_identity_reads_empty() {
        let journal = InMemoryJournal::<u8>::new();
        assert!(journal.read_events(&id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_midway_leaves_history_untouched() {
        let journal = InMemoryJournal::new();
        journal.append_atomic(&id(), &["before"]).await.unwrap();

        journal.fail_next_append(1);
        let result = journal.append_atomic(&id(), &["e1", "e2"]).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(journal.events(&id()), vec!["before"]);

        // The failure is one-shot.
        assert_eq!(journal.append_atomic(&id(), &["after"]).await.unwrap(), 2);
        assert_eq!(journal.events(&id()), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn injected_failure_past_batch_end_still_fails() {
        let journal = InMemoryJournal::new();
        journal.fail_next_append(5);
        assert!(journal.append_atomic(&id(), &["a"]).await.is_err());
        assert!(journal.events(&id()).is_empty());
    }

    #[tokio::test]
    async fn clones_share_histories() {
        let journal = InMemoryJournal::new();
        let clone = journal.clone();
        journal.append_atomic(&id(), &[7]).await.unwrap();
        assert_eq!(clone.events(&id()), vec![7]);
    }

    #[test]
    fn stored_event_serde_roundtrip() {
        let stored = StoredEvent::new(4, "payload".to_string());
        let json = serde_json::to_string(&stored).expect("serialization should succeed");
        let back: StoredEvent<String> =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, stored);
    }
}
