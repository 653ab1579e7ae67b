//! Top-level entry point that owns one journal per entity type and one live
//! actor per entity identity.
//!
//! The store is built via [`EntityStoreBuilder`]. Each registered entity
//! type is bound to the [`EventJournal`] that holds its histories.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::actor::{CommandOutcome, EntityConfig, EntityHandle, spawn_entity_with_config};
use crate::command::ReplyTo;
use crate::entity::EventSourcedEntity;
use crate::error::{ExecuteError, SpawnError};
use crate::journal::{EventJournal, PersistenceId};

/// Type-erased handle cache keyed by `(TypeId, entity_id)`.
///
/// `TypeId` identifies the entity type at runtime; the `String` is the
/// entity id. `Box<dyn CachedHandle>` lets a single map hold
/// `EntityHandle<E>` for any concrete `E`. Downcasting recovers the typed
/// handle.
type HandleCache = HashMap<(TypeId, String), Box<dyn CachedHandle>>;

/// What the cache needs from a handle without knowing its entity type.
trait CachedHandle: Send + Sync {
    fn is_alive(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<E: EventSourcedEntity> CachedHandle for EntityHandle<E> {
    fn is_alive(&self) -> bool {
        EntityHandle::is_alive(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased journal map keyed by entity `TypeId`.
///
/// Each value is an `Arc<dyn EventJournal<E::Event>>` for the matching `E`.
type JournalMap = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Registry that manages entity actor lifecycles.
///
/// Guarantees at most one live actor per identity within this store, which
/// is what keeps every entity's command processing sequential.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct EntityStore {
    journals: Arc<JournalMap>,
    cache: Arc<RwLock<HandleCache>>,
    config: EntityConfig,
}

// Manual `Debug` because `dyn Any` is not `Debug`.
impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity_types", &self.journals.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EntityStore {
    /// Start building a store.
    pub fn builder() -> EntityStoreBuilder {
        EntityStoreBuilder::new()
    }

    /// Get a handle to an entity, spawning its actor if needed.
    ///
    /// If the actor is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise recovers the entity's state from
    /// its journal and spawns a new actor.
    ///
    /// # Errors
    ///
    /// * [`SpawnError::Unregistered`] -- `E` was not registered.
    /// * [`SpawnError::Storage`] -- the history could not be read.
    /// * [`SpawnError::InvalidTransition`] -- the history does not fold.
    pub async fn get<E: EventSourcedEntity>(
        &self,
        id: &str,
    ) -> Result<EntityHandle<E>, SpawnError> {
        let key = (TypeId::of::<E>(), id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(boxed) = cache.get(&key)
                && let Some(handle) = boxed.as_any().downcast_ref::<EntityHandle<E>>()
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path under the write lock, so two callers cannot both spawn
        // an actor for the same identity.
        let mut cache = self.cache.write().await;
        if let Some(boxed) = cache.get(&key)
            && let Some(handle) = boxed.as_any().downcast_ref::<EntityHandle<E>>()
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        // Actors that stopped or idled out leave their handles behind.
        cache.retain(|_, handle| handle.is_alive());

        let journal = self.journal::<E>()?;
        tracing::debug!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %id,
            "spawning actor"
        );
        let handle =
            spawn_entity_with_config::<E>(PersistenceId::of::<E>(id), journal, self.config)
                .await?;

        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Send a command to entity `id` of type `E`.
    ///
    /// Convenience for [`get`](EntityStore::get) followed by
    /// [`EntityHandle::send`].
    ///
    /// # Errors
    ///
    /// Spawn failures map onto the matching [`ExecuteError`] variant;
    /// command failures are as from [`EntityHandle::send`].
    pub async fn send<E: EventSourcedEntity>(
        &self,
        id: &str,
        command: E::Command,
    ) -> Result<CommandOutcome, ExecuteError> {
        self.live::<E>(id).await?.send(command).await
    }

    /// Ask entity `id` of type `E` and wait for the reply.
    ///
    /// # Errors
    ///
    /// As [`send`](EntityStore::send), plus the reply errors of
    /// [`EntityHandle::ask`].
    pub async fn ask<E: EventSourcedEntity, R: Send + 'static>(
        &self,
        id: &str,
        make_command: impl FnOnce(ReplyTo<R>) -> E::Command,
    ) -> Result<R, ExecuteError> {
        self.live::<E>(id).await?.ask(make_command).await
    }

    /// Ids of the actors currently cached and alive for entity type `E`.
    pub async fn live_entity_ids<E: EventSourcedEntity>(&self) -> Vec<String> {
        let cache = self.cache.read().await;
        let mut ids: Vec<String> = cache
            .iter()
            .filter(|((type_id, _), _)| *type_id == TypeId::of::<E>())
            .filter_map(|((_, id), boxed)| {
                boxed
                    .as_any()
                    .downcast_ref::<EntityHandle<E>>()
                    .filter(|handle| handle.is_alive())
                    .map(|_| id.clone())
            })
            .collect();
        ids.sort();
        ids
    }

    async fn live<E: EventSourcedEntity>(
        &self,
        id: &str,
    ) -> Result<EntityHandle<E>, ExecuteError> {
        self.get::<E>(id).await.map_err(|e| {
            tracing::error!(
                entity_type = E::ENTITY_TYPE,
                entity_id = %id,
                error = %e,
                "failed to spawn entity"
            );
            ExecuteError::from(e)
        })
    }

    fn journal<E: EventSourcedEntity>(
        &self,
    ) -> Result<Arc<dyn EventJournal<E::Event>>, SpawnError> {
        self.journals
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<dyn EventJournal<E::Event>>>())
            .cloned()
            .ok_or(SpawnError::Unregistered(E::ENTITY_TYPE))
    }
}

/// Builder for configuring and creating an [`EntityStore`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use eventfold_effects::ledger::AccountEntity;
/// use eventfold_effects::{EntityStore, JsonlJournal};
///
/// let store = EntityStore::builder()
///     .entity::<AccountEntity>(Arc::new(JsonlJournal::new("/tmp/ledger")))
///     .idle_timeout(Duration::from_secs(60))
///     .build();
/// ```
pub struct EntityStoreBuilder {
    journals: JournalMap,
    config: EntityConfig,
}

impl EntityStoreBuilder {
    /// Create a new builder with no entity types and default configuration.
    pub fn new() -> Self {
        Self {
            journals: HashMap::new(),
            config: EntityConfig::default(),
        }
    }

    /// Register entity type `E`, storing its histories in `journal`.
    ///
    /// Registering the same type twice keeps the last journal.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn entity<E: EventSourcedEntity>(
        mut self,
        journal: Arc<dyn EventJournal<E::Event>>,
    ) -> Self {
        self.journals.insert(TypeId::of::<E>(), Box::new(journal));
        self
    }

    /// Set the idle timeout for actor eviction.
    ///
    /// Actors that receive no messages for this duration shut down. The
    /// next [`get`](EntityStore::get) call transparently re-spawns the
    /// actor from its history.
    ///
    /// Defaults to 5 minutes.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the capacity of each actor's command mailbox.
    ///
    /// Senders wait when the mailbox is full. Values below 1 are treated
    /// as 1. Defaults to 32.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Build the [`EntityStore`].
    pub fn build(self) -> EntityStore {
        EntityStore {
            journals: Arc::new(self.journals),
            cache: Arc::new(RwLock::new(HashMap::new())),
            config: self.config,
        }
    }
}

impl Default for EntityStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAILBOX_CAPACITY};
    use crate::entity::test_fixtures::{Counter, CounterCommand, CounterEvent};
    use crate::journal::InMemoryJournal;

    fn store_with(journal: &InMemoryJournal<CounterEvent>) -> EntityStore {
        EntityStore::builder()
            .entity::<Counter>(Arc::new(journal.clone()))
            .build()
    }

    #[test]
    fn builder_defaults() {
        let store = EntityStoreBuilder::default().build();
        assert_eq!(store.config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(store.config.mailbox_capacity, DEFAULT_MAILBOX_CAPACITY);
    }

    #[test]
    fn builder_sets_config() {
        let store = EntityStore::builder()
            .idle_timeout(Duration::from_secs(5))
            .mailbox_capacity(4)
            .build();
        assert_eq!(store.config.idle_timeout, Duration::from_secs(5));
        assert_eq!(store.config.mailbox_capacity, 4);
    }

    #[tokio::test]
    async fn get_unregistered_type_fails() {
        let store = EntityStore::builder().build();
        let result = store.get::<Counter>("c-1").await;
        assert!(matches!(result, Err(SpawnError::Unregistered("counter"))));
    }

    #[tokio::test]
    async fn send_to_unregistered_type_fails() {
        let store = EntityStore::builder().build();
        let result = store.send::<Counter>("c-1", CounterCommand::Increment).await;
        assert!(matches!(result, Err(ExecuteError::Unregistered("counter"))));
    }

    #[tokio::test]
    async fn get_returns_cached_handle() {
        let journal = InMemoryJournal::new();
        let store = store_with(&journal);

        let h1 = store.get::<Counter>("c-1").await.expect("get should succeed");
        h1.send(CounterCommand::Increment)
            .await
            .expect("send should succeed");
        let h2 = store.get::<Counter>("c-1").await.expect("get should succeed");

        assert_eq!(h2.state().await.expect("state").value, 1);
        assert_eq!(store.live_entity_ids::<Counter>().await, vec!["c-1"]);
    }

    #[tokio::test]
    async fn identities_are_isolated() {
        let journal = InMemoryJournal::new();
        let store = store_with(&journal);

        store
            .send::<Counter>("a", CounterCommand::Increment)
            .await
            .expect("send should succeed");
        store
            .send::<Counter>("b", CounterCommand::AddAll(vec![5]))
            .await
            .expect("send should succeed");

        let a = store.ask::<Counter, u64>("a", CounterCommand::Get).await;
        let b = store.ask::<Counter, u64>("b", CounterCommand::Get).await;
        assert_eq!(a.expect("ask a"), 1);
        assert_eq!(b.expect("ask b"), 5);
        assert_eq!(store.live_entity_ids::<Counter>().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stopped_entity_is_respawned_with_recovered_state() {
        let journal = InMemoryJournal::new();
        let store = store_with(&journal);

        store
            .send::<Counter>("c-1", CounterCommand::AddAll(vec![3]))
            .await
            .expect("send should succeed");
        let handle = store.get::<Counter>("c-1").await.expect("get should succeed");
        let outcome = handle
            .send(CounterCommand::Stop)
            .await
            .expect("stop should succeed");
        assert!(outcome.is_stopped());
        while handle.is_alive() {
            tokio::task::yield_now().await;
        }

        let value = store
            .ask::<Counter, u64>("c-1", CounterCommand::Get)
            .await
            .expect("ask should succeed after respawn");
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn idle_actor_is_respawned() {
        let journal = InMemoryJournal::new();
        let store = EntityStore::builder()
            .entity::<Counter>(Arc::new(journal.clone()))
            .idle_timeout(Duration::from_millis(100))
            .build();

        let handle = store.get::<Counter>("c-1").await.expect("get should succeed");
        handle
            .send(CounterCommand::Increment)
            .await
            .expect("send should succeed");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_alive());
        assert!(store.live_entity_ids::<Counter>().await.is_empty());

        let handle = store.get::<Counter>("c-1").await.expect("get should succeed");
        assert!(handle.is_alive());
        assert_eq!(handle.state().await.expect("state").value, 1);
    }

    #[tokio::test]
    async fn spawning_prunes_handles_of_stopped_actors() {
        let journal = InMemoryJournal::new();
        let store = store_with(&journal);

        for id in ["a", "b"] {
            store
                .send::<Counter>(id, CounterCommand::Increment)
                .await
                .expect("send should succeed");
        }
        let a = store.get::<Counter>("a").await.expect("get should succeed");
        a.send(CounterCommand::Stop)
            .await
            .expect("stop should succeed");
        while a.is_alive() {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.cache.read().await.len(), 2);

        store.get::<Counter>("c").await.expect("get should succeed");

        let cache = store.cache.read().await;
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key(&(TypeId::of::<Counter>(), "a".to_owned())));
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_actor() {
        let journal = InMemoryJournal::new();
        let store = store_with(&journal);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .send::<Counter>("shared", CounterCommand::Increment)
                    .await
                    .expect("send should succeed");
            }));
        }
        for task in tasks {
            task.await.expect("task should not panic");
        }

        let value = store
            .ask::<Counter, u64>("shared", CounterCommand::Get)
            .await
            .expect("ask should succeed");
        assert_eq!(value, 8);
        assert_eq!(journal.events(&PersistenceId::of::<Counter>("shared")).len(), 8);
    }
}
