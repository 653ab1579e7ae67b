//! Crate-level error types for effect interpretation and entity lifecycle.
//!
//! Only two conditions are failures in the error sense: a durable append
//! that did not happen ([`StorageError`]) and an event that cannot be
//! folded into the current state ([`InvalidTransition`]). Unhandled commands
//! and validation rejections are modeled outcomes, carried by the effect
//! value and its reply, and never surface here.

use std::io;

/// Error returned by an [`EventJournal`](crate::EventJournal) when a batch
/// could not be made durable or the history could not be read back.
///
/// When an append fails, none of the batch's events are visible in the
/// history.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An event could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A complete journal record could not be decoded.
    ///
    /// Torn trailing writes are tolerated; this variant means a record
    /// in the middle of the history is damaged.
    #[error("corrupted journal record at line {line}: {reason}")]
    Corrupted {
        /// 1-based line number of the damaged record.
        line: usize,
        /// Decoder message.
        reason: String,
    },

    /// The backend refused the write (e.g. it is shutting down or a test
    /// injected a failure).
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// A transition function received an event that is invalid for the
/// current state variant.
///
/// This is a defect (corrupted history or a handler bug), not a domain
/// outcome. The interpreter stops the entity rather than continue with an
/// undefined state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: event {event} cannot be applied to state {state}")]
pub struct InvalidTransition {
    /// Name of the state variant the event was applied to.
    pub state: String,
    /// Name of the offending event.
    pub event: String,
}

impl InvalidTransition {
    /// Build an `InvalidTransition` from a state and event name.
    pub fn new(state: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            event: event.into(),
        }
    }
}

/// Error returned when sending a command to a running entity fails.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The durable append failed; no state change happened and no side
    /// action ran.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persisted event could not be folded into state. The entity has
    /// been stopped.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// The command was interpreted but no reply was delivered.
    #[error("command completed without a reply")]
    NoReply,

    /// The current state does not handle the command and no reply was
    /// attached to the unhandled outcome.
    #[error("command not handled in the current state")]
    Unhandled,

    /// The entity actor has exited (stopped, idled out, or failed).
    #[error("entity actor is no longer running")]
    ActorGone,

    /// No journal was registered for the entity type.
    #[error("entity type '{0}' is not registered with the store")]
    Unregistered(&'static str),
}

impl From<SpawnError> for ExecuteError {
    fn from(e: SpawnError) -> Self {
        match e {
            SpawnError::Unregistered(entity_type) => Self::Unregistered(entity_type),
            SpawnError::Storage(e) => Self::Storage(e),
            SpawnError::InvalidTransition(e) => Self::InvalidTransition(e),
        }
    }
}

/// Error returned when reading the current state of an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The entity actor has exited, so its state can no longer be queried.
    #[error("entity actor is no longer running")]
    ActorGone,
}

/// Error returned when an entity actor cannot be started.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// No journal was registered for the entity type.
    #[error("entity type '{0}' is not registered with the store")]
    Unregistered(&'static str),

    /// Reading the history during recovery failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The recovered history does not fold into a valid state.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}
