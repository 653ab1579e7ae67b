//! Entity state machine and command-handler traits.

use crate::effect::HandlerEffect;
use crate::error::InvalidTransition;

/// The state of an event-sourced entity.
///
/// Each variant owns its transition function: [`apply`](EntityState::apply)
/// derives the next state from the current one and an event. It is total
/// over the events valid in the current variant and returns
/// [`InvalidTransition`] for every other pair. A state value is never
/// mutated in place; `apply` returns a new value.
pub trait EntityState<Ev>: Sized {
    /// Derive the state that follows `event`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `event` cannot happen in this state.
    fn apply(&self, event: &Ev) -> Result<Self, InvalidTransition>;
}

/// Fold `events` through [`EntityState::apply`], starting from `initial`.
///
/// # Errors
///
/// Returns the first [`InvalidTransition`] encountered.
pub fn replay<'a, Ev: 'a, S: EntityState<Ev> + Clone>(
    initial: &S,
    events: impl IntoIterator<Item = &'a Ev>,
) -> Result<S, InvalidTransition> {
    events
        .into_iter()
        .try_fold(initial.clone(), |state, event| state.apply(event))
}

/// An event-sourced entity type: its command, event and state types, and
/// the command handler that decides what should happen.
///
/// # Contract
///
/// - [`handle_command`](EventSourcedEntity::handle_command) is a pure
///   decision function: no I/O, no side effects. Everything it wants done
///   is described by the returned effect.
/// - State transitions live on [`Self::State`](EventSourcedEntity::State),
///   never in the handler.
/// - The reply-enforcement mode is fixed by the choice of
///   [`Self::Effect`](EventSourcedEntity::Effect): [`Effect`](crate::Effect)
///   for unconstrained handlers, [`ReplyEffect`](crate::ReplyEffect) when
///   every command must produce a reply decision.
pub trait EventSourcedEntity: Send + 'static {
    /// Identifies this entity type (e.g. `"account"`).
    const ENTITY_TYPE: &'static str;

    /// Commands this entity accepts.
    type Command: Send + 'static;

    /// Events this entity persists.
    type Event: Clone + Send + Sync + 'static;

    /// State derived by folding events.
    type State: EntityState<Self::Event> + Clone + Send + Sync + 'static;

    /// Handler return type; selects the reply-enforcement mode.
    type Effect: HandlerEffect<Self::Event, Self::State>;

    /// State of an entity with no history.
    fn empty_state() -> Self::State;

    /// Decide what should happen for `command` given `state`.
    fn handle_command(state: &Self::State, command: Self::Command) -> Self::Effect;
}
