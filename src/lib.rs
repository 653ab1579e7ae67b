//! Decision effects for event-sourced entities.
//!
//! Command handlers return an [`Effect`] (or a [`ReplyEffect`] when every
//! command must be answered) describing the events to persist and the side
//! actions to run once they are durable. The interpreter appends the events
//! atomically, folds them through the state's transition function, and
//! then runs the side actions in order.

mod actor;
pub use actor::{CommandOutcome, EntityHandle, Interpreted, interpret, spawn_entity};
mod command;
mod effect;
pub use effect::{Effect, HandlerEffect, ReplyEffect, ReplyMode};
mod entity;
pub use entity::{EntityState, EventSourcedEntity, replay};
mod error;
mod journal;
pub mod ledger;
mod side_action;
mod storage;
mod store;

pub use command::{ExpectingReply, ReplyReceiver, ReplyTo};
pub use error::{ExecuteError, InvalidTransition, SpawnError, StateError, StorageError};
pub use journal::{BoxFuture, EventJournal, InMemoryJournal, PersistenceId, StoredEvent};
pub use side_action::{SideAction, SideActionKind};
pub use storage::JsonlJournal;
pub use store::{EntityStore, EntityStoreBuilder};
