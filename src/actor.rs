//! Effect interpretation and the actor loop that owns one entity.
//!
//! [`interpret`] turns an [`Effect`] into durable history, a new state and
//! executed side actions, in that order. The actor runs as a tokio task
//! and processes commands for a single [`PersistenceId`] one at a time, so
//! the command handler and transition functions never see concurrent
//! mutation.
//!
//! Public API: [`EntityHandle`] (cloneable async handle), [`spawn_entity`]
//! (recovers state from the journal and starts the actor) and
//! [`interpret`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::command::ReplyTo;
use crate::effect::{EffectParts, HandlerEffect};
use crate::entity::{EntityState, EventSourcedEntity, replay};
use crate::error::{ExecuteError, SpawnError, StateError};
use crate::journal::{EventJournal, PersistenceId};

/// Default idle timeout for actors: 5 minutes.
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default mailbox capacity.
pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Configuration for the actor loop.
///
/// Callers configure these through
/// [`EntityStoreBuilder`](crate::EntityStoreBuilder).
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntityConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
    /// Capacity of the bounded command channel.
    pub mailbox_capacity: usize,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// What interpreting one effect did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    persisted: usize,
    last_sequence_nr: Option<u64>,
    unhandled: bool,
    stopped: bool,
}

impl CommandOutcome {
    /// Number of events appended to the history.
    pub fn persisted(&self) -> usize {
        self.persisted
    }

    /// Sequence number of the last appended event, if any were appended.
    pub fn last_sequence_nr(&self) -> Option<u64> {
        self.last_sequence_nr
    }

    /// Whether the command was not handled in the current state.
    pub fn is_unhandled(&self) -> bool {
        self.unhandled
    }

    /// Whether the effect stopped the entity.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Result of [`interpret`]: the state after the effect and its outcome.
#[derive(Debug)]
pub struct Interpreted<S> {
    /// State after folding the effect's events.
    pub state: S,
    /// What happened.
    pub outcome: CommandOutcome,
}

/// Interpret `effect` for the entity `id` whose current state is `state`.
///
/// `effect` is either an [`Effect`](crate::Effect) or a
/// [`ReplyEffect`](crate::ReplyEffect).
///
/// 1. If the effect carries events, append them to `journal` as one atomic
///    unit. On failure nothing else happens: the state is unchanged and the
///    side actions are dropped without running.
/// 2. Fold each event, in order, through [`EntityState::apply`].
/// 3. Run the side actions in registration order against the new state.
///    A `Stop` never cuts the list short; it is reported through
///    [`CommandOutcome::is_stopped`] once every action has run.
///
/// # Errors
///
/// * [`ExecuteError::Storage`] -- the append failed.
/// * [`ExecuteError::InvalidTransition`] -- an appended event does not fold
///   into the current state. The history now holds events the state
///   machine rejects; the caller must not keep using this entity.
pub async fn interpret<Ev, S, J, H>(
    journal: &J,
    id: &PersistenceId,
    state: &S,
    effect: H,
) -> Result<Interpreted<S>, ExecuteError>
where
    S: EntityState<Ev> + Clone,
    J: EventJournal<Ev> + ?Sized,
    H: HandlerEffect<Ev, S>,
{
    let EffectParts {
        events,
        side_actions,
        unhandled,
    } = effect.into_parts();

    let mut last_sequence_nr = None;
    if !events.is_empty() {
        match journal.append_atomic(id, &events).await {
            Ok(last) => last_sequence_nr = Some(last),
            Err(e) => {
                tracing::error!(persistence_id = %id, error = %e, "failed to persist events");
                return Err(e.into());
            }
        }
        tracing::info!(count = events.len(), "events appended");
    }

    let next = replay(state, &events).inspect_err(|e| {
        tracing::error!(persistence_id = %id, error = %e, "persisted event rejected by state");
    })?;

    let mut stopped = false;
    for action in side_actions {
        stopped |= action.execute(&next);
    }

    if unhandled {
        tracing::warn!(persistence_id = %id, "command not handled in current state");
    }

    Ok(Interpreted {
        state: next,
        outcome: CommandOutcome {
            persisted: events.len(),
            last_sequence_nr,
            unhandled,
            stopped,
        },
    })
}

/// Messages sent from [`EntityHandle`] to the actor loop.
///
/// Each variant carries a `oneshot::Sender` for the actor to reply on once
/// the operation completes.
enum ActorMessage<E: EventSourcedEntity> {
    /// Handle a command and interpret the resulting effect.
    Execute {
        command: E::Command,
        reply: oneshot::Sender<Result<CommandOutcome, ExecuteError>>,
    },

    /// Retrieve a clone of the current state.
    GetState {
        reply: oneshot::Sender<E::State>,
    },

    /// Gracefully shut down the actor loop.
    Shutdown,
}

/// Owns one entity's state and processes its commands sequentially.
///
/// The loop exits when the channel closes (all handles dropped), a
/// `Shutdown` message arrives, the idle timeout elapses, an effect stops
/// the entity, or interpretation hits an invalid transition. Messages still
/// queued at exit are dropped, so their senders observe
/// [`ExecuteError::ActorGone`].
async fn run_actor<E: EventSourcedEntity>(
    id: PersistenceId,
    journal: Arc<dyn EventJournal<E::Event>>,
    mut state: E::State,
    mut rx: mpsc::Receiver<ActorMessage<E>>,
    config: EntityConfig,
) {
    loop {
        let msg = tokio::time::timeout(config.idle_timeout, rx.recv()).await;

        match msg {
            Ok(Some(ActorMessage::Execute { command, reply })) => {
                let effect = E::handle_command(&state, command);
                let span = tracing::info_span!(
                    "execute",
                    entity_type = E::ENTITY_TYPE,
                    entity_id = id.entity_id(),
                );
                let result = interpret(journal.as_ref(), &id, &state, effect)
                    .instrument(span)
                    .await;

                let keep_running = match result {
                    Ok(Interpreted {
                        state: next,
                        outcome,
                    }) => {
                        state = next;
                        let _ = reply.send(Ok(outcome));
                        !outcome.is_stopped()
                    }
                    Err(e @ ExecuteError::InvalidTransition(_)) => {
                        let _ = reply.send(Err(e));
                        false
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        true
                    }
                };
                if !keep_running {
                    tracing::info!(persistence_id = %id, "entity stopped");
                    break;
                }
            }

            Ok(Some(ActorMessage::GetState { reply })) => {
                let _ = reply.send(state.clone());
            }

            Ok(Some(ActorMessage::Shutdown)) | Ok(None) => break,

            Err(_elapsed) => {
                tracing::info!(persistence_id = %id, "actor idle, shutting down");
                break;
            }
        }
    }
}

/// Async handle to a running entity actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the actor
/// task over a bounded channel.
///
/// # Type Parameters
///
/// * `E` - The [`EventSourcedEntity`] type this handle controls.
pub struct EntityHandle<E: EventSourcedEntity> {
    id: PersistenceId,
    sender: mpsc::Sender<ActorMessage<E>>,
    _entity: PhantomData<fn() -> E>,
}

// Manual `Clone` because `E` itself need not be `Clone`.
impl<E: EventSourcedEntity> Clone for EntityHandle<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: EventSourcedEntity> std::fmt::Debug for EntityHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<E: EventSourcedEntity> EntityHandle<E> {
    /// Send a command and wait until its effect has been interpreted.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Storage`] -- the events could not be persisted.
    /// * [`ExecuteError::InvalidTransition`] -- the entity hit a fatal
    ///   transition and has stopped.
    /// * [`ExecuteError::ActorGone`] -- the actor has exited.
    pub async fn send(&self, command: E::Command) -> Result<CommandOutcome, ExecuteError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute { command, reply: tx })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Send a command built around a fresh reply recipient and wait for
    /// the reply.
    ///
    /// Side actions run before the actor acknowledges the command, so any
    /// reply has already been delivered when `send` returns.
    ///
    /// # Errors
    ///
    /// Everything [`send`](EntityHandle::send) returns, plus:
    ///
    /// * [`ExecuteError::Unhandled`] -- the command was unhandled and no
    ///   reply was attached.
    /// * [`ExecuteError::NoReply`] -- the command was handled but nothing
    ///   was delivered to the recipient.
    pub async fn ask<R: Send + 'static>(
        &self,
        make_command: impl FnOnce(ReplyTo<R>) -> E::Command,
    ) -> Result<R, ExecuteError> {
        let (reply_to, mut receiver) = ReplyTo::channel();
        let outcome = self.send(make_command(reply_to)).await?;
        match receiver.try_recv() {
            Some(reply) => Ok(reply),
            None if outcome.is_unhandled() => Err(ExecuteError::Unhandled),
            None => Err(ExecuteError::NoReply),
        }
    }

    /// Read a clone of the current state.
    ///
    /// # Errors
    ///
    /// * [`StateError::ActorGone`] -- the actor has exited.
    pub async fn state(&self) -> Result<E::State, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)
    }

    /// Ask the actor to exit after the messages already queued.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// The identity this handle addresses.
    pub fn persistence_id(&self) -> &PersistenceId {
        &self.id
    }

    /// Check whether the actor backing this handle is still running.
    ///
    /// Returns `false` once the actor has exited (stopped, idled out, or
    /// failed). The store uses this to evict stale handles.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn an entity actor with explicit configuration.
///
/// Internal entry point used by [`EntityStore`](crate::EntityStore).
pub(crate) async fn spawn_entity_with_config<E: EventSourcedEntity>(
    id: PersistenceId,
    journal: Arc<dyn EventJournal<E::Event>>,
    config: EntityConfig,
) -> Result<EntityHandle<E>, SpawnError> {
    let history = journal.read_events(&id).await?;
    let state = replay(&E::empty_state(), history.iter().map(|stored| &stored.event))?;

    let mode = <E::Effect as HandlerEffect<E::Event, E::State>>::MODE;
    tracing::debug!(
        entity_type = E::ENTITY_TYPE,
        entity_id = id.entity_id(),
        recovered = history.len(),
        ?mode,
        "spawning entity actor"
    );

    let (tx, rx) = mpsc::channel::<ActorMessage<E>>(config.mailbox_capacity.max(1));
    tokio::spawn(run_actor::<E>(id.clone(), journal, state, rx, config));

    Ok(EntityHandle {
        id,
        sender: tx,
        _entity: PhantomData,
    })
}

/// Spawn an actor for entity `id`, recovering its state from `journal`.
///
/// The actor created by this function never idles out. For configurable
/// timeouts, use [`EntityStoreBuilder::idle_timeout`](crate::EntityStoreBuilder::idle_timeout).
///
/// # Errors
///
/// * [`SpawnError::Storage`] -- the history could not be read.
/// * [`SpawnError::InvalidTransition`] -- the history does not fold into a
///   valid state.
pub async fn spawn_entity<E: EventSourcedEntity>(
    id: PersistenceId,
    journal: Arc<dyn EventJournal<E::Event>>,
) -> Result<EntityHandle<E>, SpawnError> {
    // `u64::MAX / 2` avoids overflow when tokio adds the timeout duration
    // to the current `Instant`.
    let config = EntityConfig {
        idle_timeout: Duration::from_secs(u64::MAX / 2),
        ..EntityConfig::default()
    };
    spawn_entity_with_config(id, journal, config).await
}
