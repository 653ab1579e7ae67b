//! Deferred actions run by the interpreter after an effect's events are
//! durable.

use std::fmt;

use crate::command::ReplyTo;

/// Boxed callback over the post-transition state.
pub(crate) type Callback<S> = Box<dyn FnOnce(&S) + Send>;

/// A deferred, post-persistence action.
///
/// Side actions are inert values: building one runs nothing. The
/// interpreter executes them in registration order against the state that
/// results from folding the effect's events.
///
/// Only [`run`](SideAction::run) and [`stop`](SideAction::stop) actions can
/// be built directly. Reply decisions are attached through
/// [`Effect::then_reply`](crate::Effect::then_reply) and
/// [`Effect::then_no_reply`](crate::Effect::then_no_reply), which is what
/// keeps a [`ReplyEffect`](crate::ReplyEffect) at exactly one of them.
///
/// ```compile_fail
/// use eventfold_effects::{Effect, SideAction};
///
/// let effect = Effect::<u32, ()>::none().and_then(SideAction::NoReply);
/// ```
pub struct SideAction<S> {
    action: Action<S>,
}

enum Action<S> {
    Run(Callback<S>),
    Stop,
    Reply(Callback<S>),
    NoReply,
}

/// Discriminant of a [`SideAction`], for inspection without executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideActionKind {
    /// Run a callback over the new state.
    Run,
    /// Stop the entity once the effect's side actions have run.
    Stop,
    /// Deliver a reply computed from the new state.
    Reply,
    /// Explicit decision that the command gets no reply.
    NoReply,
}

impl<S> SideAction<S> {
    /// A callback over the new state.
    pub fn run(f: impl FnOnce(&S) + Send + 'static) -> Self {
        Self {
            action: Action::Run(Box::new(f)),
        }
    }

    /// Stop the entity after the effect's side actions have run.
    pub fn stop() -> Self {
        Self {
            action: Action::Stop,
        }
    }

    /// A reply to `reply_to`, computed from the new state by `f`.
    pub(crate) fn reply<R: Send + 'static>(
        reply_to: ReplyTo<R>,
        f: impl FnOnce(&S) -> R + Send + 'static,
    ) -> Self {
        Self {
            action: Action::Reply(Box::new(move |state| reply_to.deliver(f(state)))),
        }
    }

    /// The explicit "no reply" decision.
    pub(crate) fn no_reply() -> Self {
        Self {
            action: Action::NoReply,
        }
    }

    /// The kind of this action.
    pub fn kind(&self) -> SideActionKind {
        match self.action {
            Action::Run(_) => SideActionKind::Run,
            Action::Stop => SideActionKind::Stop,
            Action::Reply(_) => SideActionKind::Reply,
            Action::NoReply => SideActionKind::NoReply,
        }
    }

    /// Whether this action is a reply decision (a reply or an explicit
    /// no-reply).
    pub fn is_reply_decision(&self) -> bool {
        matches!(self.action, Action::Reply(_) | Action::NoReply)
    }

    /// Execute the action against `state`.
    ///
    /// Returns `true` if the action requests the entity to stop.
    pub(crate) fn execute(self, state: &S) -> bool {
        match self.action {
            Action::Run(f) | Action::Reply(f) => {
                f(state);
                false
            }
            Action::Stop => true,
            Action::NoReply => false,
        }
    }
}

impl<S> fmt::Debug for SideAction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind(), f)
    }
}
