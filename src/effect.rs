//! The decision value returned by command handlers.
//!
//! A handler never mutates state. It returns an [`Effect`] describing which
//! events to persist and which [`SideAction`]s to run once they are
//! durable, or a [`ReplyEffect`] when the entity is assembled in
//! [`ReplyMode::EnforcedReply`].
//!
//! ```text
//! persist / persist_all / none / unhandled / stop
//!     │
//!     ├─ then_run / and_then / then_stop      ──► Effect
//!     │
//!     └─ then_reply / then_no_reply            ──► ReplyEffect
//! ```
//!
//! Combinators take `self` by value. A composed effect is a new value and
//! the one it was built from has been moved, so no previously returned
//! effect can be observed changing.

use std::fmt;

use crate::command::ExpectingReply;
use crate::side_action::{SideAction, SideActionKind};

/// An immutable decision: events to persist atomically and side actions to
/// run, in order, after persistence succeeds.
///
/// # Type Parameters
///
/// * `Ev` - The entity's event type.
/// * `S` - The entity's state type, seen by side actions after the fold.
///
/// # Examples
///
/// ```
/// use eventfold_effects::{Effect, SideActionKind};
///
/// let effect = Effect::<&str, u32>::persist("Deposited")
///     .then_run(|balance| println!("balance is now {balance}"))
///     .then_stop();
///
/// assert_eq!(effect.events(), &["Deposited"]);
/// assert_eq!(
///     effect.side_actions(),
///     vec![SideActionKind::Run, SideActionKind::Stop]
/// );
/// ```
#[must_use = "an effect does nothing until it is returned to the interpreter"]
pub struct Effect<Ev, S> {
    events: Vec<Ev>,
    side_actions: Vec<SideAction<S>>,
    unhandled: bool,
}

impl<Ev, S> Effect<Ev, S> {
    fn with_events(events: Vec<Ev>) -> Self {
        Self {
            events,
            side_actions: Vec::new(),
            unhandled: false,
        }
    }

    /// Persist a single event.
    pub fn persist(event: Ev) -> Self {
        Self::with_events(vec![event])
    }

    /// Persist several events as one atomic unit, in iteration order.
    ///
    /// Either all of them become durable or none do. Each is folded into
    /// state only after the whole batch is durable. An empty iterator is
    /// equivalent to [`none`](Effect::none).
    pub fn persist_all(events: impl IntoIterator<Item = Ev>) -> Self {
        Self::with_events(events.into_iter().collect())
    }

    /// An effect with no events.
    pub fn none() -> Self {
        Self::with_events(Vec::new())
    }

    /// The command does not apply to the current state.
    ///
    /// Carries no events. This is not an error: the interpreter reports it
    /// through [`CommandOutcome::is_unhandled`](crate::CommandOutcome::is_unhandled).
    pub fn unhandled() -> Self {
        Self {
            unhandled: true,
            ..Self::none()
        }
    }

    /// No events, then stop the entity.
    pub fn stop() -> Self {
        Self::none().then_stop()
    }

    /// Append a side action.
    pub fn and_then(mut self, action: SideAction<S>) -> Self {
        self.side_actions.push(action);
        self
    }

    /// Append a callback run over the post-transition state.
    pub fn then_run(self, f: impl FnOnce(&S) + Send + 'static) -> Self {
        self.and_then(SideAction::run(f))
    }

    /// Append a [`SideAction::stop`].
    pub fn then_stop(self) -> Self {
        self.and_then(SideAction::stop())
    }

    /// Append a reply to `command`'s recipient, computed from the
    /// post-transition state, and promote the result to a [`ReplyEffect`].
    pub fn then_reply<C>(
        self,
        command: &C,
        f: impl FnOnce(&S) -> C::Reply + Send + 'static,
    ) -> ReplyEffect<Ev, S>
    where
        C: ExpectingReply + ?Sized,
    {
        let reply_to = command.reply_to().clone();
        ReplyEffect {
            inner: self.and_then(SideAction::reply(reply_to, f)),
        }
    }

    /// Append an explicit "no reply" decision and promote the result to a
    /// [`ReplyEffect`].
    ///
    /// Unlike simply omitting a reply, this is a visible decision that
    /// satisfies reply enforcement.
    pub fn then_no_reply(self) -> ReplyEffect<Ev, S> {
        ReplyEffect {
            inner: self.and_then(SideAction::no_reply()),
        }
    }

    /// Shortcut for `Effect::none().then_reply(command, |_| message)`.
    pub fn reply<C>(command: &C, message: C::Reply) -> ReplyEffect<Ev, S>
    where
        C: ExpectingReply + ?Sized,
    {
        Self::none().then_reply(command, move |_| message)
    }

    /// Shortcut for `Effect::none().then_no_reply()`.
    pub fn no_reply() -> ReplyEffect<Ev, S> {
        Self::none().then_no_reply()
    }

    /// The events to persist, in order.
    pub fn events(&self) -> &[Ev] {
        &self.events
    }

    /// The kinds of the registered side actions, in order.
    pub fn side_actions(&self) -> Vec<SideActionKind> {
        self.side_actions.iter().map(SideAction::kind).collect()
    }

    /// Whether this effect was built from [`unhandled`](Effect::unhandled).
    pub fn is_unhandled(&self) -> bool {
        self.unhandled
    }

    /// Whether any side action stops the entity.
    pub fn stops(&self) -> bool {
        self.side_actions
            .iter()
            .any(|a| a.kind() == SideActionKind::Stop)
    }

    /// Whether a reply or an explicit no-reply has been attached.
    pub fn has_reply_decision(&self) -> bool {
        self.side_actions.iter().any(SideAction::is_reply_decision)
    }

    fn decompose(self) -> EffectParts<Ev, S> {
        EffectParts {
            events: self.events,
            side_actions: self.side_actions,
            unhandled: self.unhandled,
        }
    }
}

impl<Ev: fmt::Debug, S> fmt::Debug for Effect<Ev, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("events", &self.events)
            .field("side_actions", &self.side_actions)
            .field("unhandled", &self.unhandled)
            .finish()
    }
}

/// Decomposed effect, consumed by the interpreter.
///
/// Opaque outside this crate, so an effect taken apart cannot be promoted
/// to a [`ReplyEffect`] a second time.
pub struct EffectParts<Ev, S> {
    pub(crate) events: Vec<Ev>,
    pub(crate) side_actions: Vec<SideAction<S>>,
    pub(crate) unhandled: bool,
}

/// An [`Effect`] that is guaranteed, by construction, to carry exactly one
/// reply decision.
///
/// There is no public constructor and no conversion from [`Effect`]. The
/// only ways to obtain one are [`Effect::then_reply`],
/// [`Effect::then_no_reply`], [`Effect::reply`] and [`Effect::no_reply`].
/// A `ReplyEffect` offers no further combinators, so a second reply cannot
/// be attached.
///
/// ```
/// use eventfold_effects::{Effect, ReplyEffect, ReplyTo};
///
/// let (reply_to, _rx) = ReplyTo::<&str>::channel();
/// let effect: ReplyEffect<u32, ()> = Effect::persist(1).then_reply(&reply_to, |_| "ok");
/// assert!(effect.has_reply_decision());
/// ```
///
/// An effect without a reply decision does not coerce:
///
/// ```compile_fail
/// use eventfold_effects::{Effect, ReplyEffect};
///
/// let effect: ReplyEffect<u32, ()> = Effect::persist(1);
/// ```
///
/// ```compile_fail
/// use eventfold_effects::{Effect, ReplyEffect};
///
/// let effect: ReplyEffect<u32, ()> = Effect::unhandled().then_run(|_| ()).then_stop();
/// ```
///
/// ```compile_fail
/// use eventfold_effects::{Effect, ReplyEffect};
///
/// let effect: ReplyEffect<u32, ()> = Effect::stop().into();
/// ```
///
/// Nor can one be assembled by hand:
///
/// ```compile_fail
/// use eventfold_effects::{Effect, ReplyEffect};
///
/// let effect: ReplyEffect<u32, ()> = ReplyEffect { inner: Effect::none() };
/// ```
///
/// And a reply decision cannot be taken twice, not even by taking the
/// effect apart first:
///
/// ```compile_fail
/// use eventfold_effects::{Effect, ReplyTo};
///
/// let (reply_to, _rx) = ReplyTo::<&str>::channel();
/// let effect = Effect::<u32, ()>::none()
///     .then_reply(&reply_to, |_| "first")
///     .into_effect()
///     .then_reply(&reply_to, |_| "second");
/// ```
///
/// ```compile_fail
/// use eventfold_effects::{Effect, HandlerEffect, ReplyTo};
///
/// let (reply_to, _rx) = ReplyTo::<&str>::channel();
/// let parts = Effect::<u32, ()>::no_reply().into_parts();
/// let effect = parts.then_reply(&reply_to, |_| "second");
/// ```
///
/// ```compile_fail
/// use eventfold_effects::{Effect, ReplyTo};
///
/// let (reply_to, _rx) = ReplyTo::<&str>::channel();
/// let effect = Effect::<u32, ()>::no_reply().then_reply(&reply_to, |_| "twice");
/// ```
#[must_use = "an effect does nothing until it is returned to the interpreter"]
pub struct ReplyEffect<Ev, S> {
    inner: Effect<Ev, S>,
}

impl<Ev, S> ReplyEffect<Ev, S> {
    /// The events to persist, in order.
    pub fn events(&self) -> &[Ev] {
        self.inner.events()
    }

    /// The kinds of the registered side actions, in order.
    pub fn side_actions(&self) -> Vec<SideActionKind> {
        self.inner.side_actions()
    }

    /// Whether this effect was built from [`Effect::unhandled`].
    pub fn is_unhandled(&self) -> bool {
        self.inner.is_unhandled()
    }

    /// Whether any side action stops the entity.
    pub fn stops(&self) -> bool {
        self.inner.stops()
    }

    /// Always `true`.
    pub fn has_reply_decision(&self) -> bool {
        self.inner.has_reply_decision()
    }
}

impl<Ev: fmt::Debug, S> fmt::Debug for ReplyEffect<Ev, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReplyEffect").field(&self.inner).finish()
    }
}

/// How a command handler's return value is constrained with respect to
/// replies. Chosen once per entity type, through
/// [`EventSourcedEntity::Effect`](crate::EventSourcedEntity::Effect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Handlers return [`Effect`]; replies are optional.
    Unconstrained,
    /// Handlers return [`ReplyEffect`]; every outcome carries a reply
    /// decision.
    EnforcedReply,
}

mod sealed {
    pub trait Sealed {}

    impl<Ev, S> Sealed for super::Effect<Ev, S> {}
    impl<Ev, S> Sealed for super::ReplyEffect<Ev, S> {}
}

/// Return type of a command handler: either [`Effect`] or [`ReplyEffect`].
///
/// Sealed; no other implementations exist.
pub trait HandlerEffect<Ev, S>: sealed::Sealed + Send + 'static {
    /// The reply-enforcement mode this return type stands for.
    const MODE: ReplyMode;

    /// Take the effect apart for [`interpret`](crate::interpret).
    fn into_parts(self) -> EffectParts<Ev, S>;
}

impl<Ev: Send + 'static, S: 'static> HandlerEffect<Ev, S> for Effect<Ev, S> {
    const MODE: ReplyMode = ReplyMode::Unconstrained;

    fn into_parts(self) -> EffectParts<Ev, S> {
        self.decompose()
    }
}

impl<Ev: Send + 'static, S: 'static> HandlerEffect<Ev, S> for ReplyEffect<Ev, S> {
    const MODE: ReplyMode = ReplyMode::EnforcedReply;

    fn into_parts(self) -> EffectParts<Ev, S> {
        self.inner.decompose()
    }
}
