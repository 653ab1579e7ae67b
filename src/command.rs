//! Reply recipients and the declared-reply-type command contract.

use std::fmt;

use tokio::sync::mpsc;

/// Addressable recipient for replies of type `R`.
///
/// Delivery is fire-and-forget: [`deliver`](ReplyTo::deliver) never
/// blocks and never reports whether the message was received. Cloning is
/// cheap and every clone addresses the same [`ReplyReceiver`].
///
/// # Examples
///
/// ```
/// use eventfold_effects::ReplyTo;
///
/// let (reply_to, mut receiver) = ReplyTo::<u32>::channel();
/// reply_to.deliver(7);
/// assert_eq!(receiver.try_recv(), Some(7));
/// ```
pub struct ReplyTo<R> {
    tx: mpsc::UnboundedSender<R>,
}

// Manual `Clone` so that `R` itself need not be `Clone`.
impl<R> Clone for ReplyTo<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R> fmt::Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyTo")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<R> ReplyTo<R> {
    /// Create a recipient handle together with the receiving end.
    pub fn channel() -> (Self, ReplyReceiver<R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, ReplyReceiver { rx })
    }

    /// Send `message` to the recipient.
    ///
    /// If the receiver has been dropped the message is discarded.
    pub fn deliver(&self, message: R) {
        if self.tx.send(message).is_err() {
            tracing::debug!("reply recipient dropped, message discarded");
        }
    }

    /// Returns `true` once the receiving end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of a [`ReplyTo`].
#[derive(Debug)]
pub struct ReplyReceiver<R> {
    rx: mpsc::UnboundedReceiver<R>,
}

impl<R> ReplyReceiver<R> {
    /// Wait for the next reply.
    ///
    /// Returns `None` once every [`ReplyTo`] clone has been dropped and no
    /// reply is buffered.
    pub async fn recv(&mut self) -> Option<R> {
        self.rx.recv().await
    }

    /// Take an already delivered reply without waiting.
    pub fn try_recv(&mut self) -> Option<R> {
        self.rx.try_recv().ok()
    }
}

/// A command that declares, at the type level, which reply it expects.
///
/// Used as the bound on [`Effect::then_reply`](crate::Effect::then_reply):
/// the reply closure must produce exactly `Self::Reply`, so a handler
/// cannot answer a command with the wrong message type.
///
/// # Examples
///
/// ```
/// use eventfold_effects::{ExpectingReply, ReplyTo};
///
/// struct GetTotal {
///     reply_to: ReplyTo<u64>,
/// }
///
/// impl ExpectingReply for GetTotal {
///     type Reply = u64;
///
///     fn reply_to(&self) -> &ReplyTo<u64> {
///         &self.reply_to
///     }
/// }
/// ```
pub trait ExpectingReply {
    /// The message type sent back to the command's originator.
    type Reply: Send + 'static;

    /// The recipient that receives the reply.
    fn reply_to(&self) -> &ReplyTo<Self::Reply>;
}

impl<R: Send + 'static> ExpectingReply for ReplyTo<R> {
    type Reply = R;

    fn reply_to(&self) -> &ReplyTo<R> {
        self
    }
}
