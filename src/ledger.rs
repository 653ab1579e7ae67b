//! Account ledger: a reply-enforced entity built on the effect algebra.
//!
//! An account is created, receives deposits and withdrawals, and is
//! eventually closed. Validation failures (a zero amount, an overdraft,
//! closing with money left) are ordinary outcomes: nothing is persisted
//! and the caller receives [`AccountReply::Rejected`].
//!
//! Every command carries its own [`ReplyTo`], and the entity uses
//! [`ReplyEffect`] as its handler type, so a handler arm that forgets to
//! reply does not compile.
//!
//! # Examples
//!
//! ```
//! use eventfold_effects::ledger::{AccountCommand, AccountEntity, AccountState};
//! use eventfold_effects::{EventSourcedEntity, ReplyTo};
//!
//! let (reply_to, _replies) = ReplyTo::channel();
//! let effect = AccountEntity::handle_command(
//!     &AccountState::Active { balance: 100 },
//!     AccountCommand::Withdraw { amount: 150, reply_to },
//! );
//!
//! // Overdrafts are rejected without persisting anything.
//! assert!(effect.events().is_empty());
//! assert!(effect.has_reply_decision());
//! ```

use serde::{Deserialize, Serialize};

use crate::command::{ExpectingReply, ReplyTo};
use crate::effect::{Effect, ReplyEffect};
use crate::entity::{EntityState, EventSourcedEntity};
use crate::error::InvalidTransition;

/// Handler return type of the ledger.
pub type AccountEffect = ReplyEffect<AccountEvent, AccountState>;

/// Lifecycle of an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountState {
    /// No history yet.
    #[default]
    Uninitialized,
    /// Open, holding `balance` minor units.
    Active {
        /// Current balance in minor units.
        balance: u64,
    },
    /// Terminal.
    Closed,
}

impl AccountState {
    /// Variant name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Active { .. } => "Active",
            Self::Closed => "Closed",
        }
    }

    /// The balance of an active account.
    pub fn balance(&self) -> Option<u64> {
        match self {
            Self::Active { balance } => Some(*balance),
            Self::Uninitialized | Self::Closed => None,
        }
    }
}

/// Facts recorded in an account's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    /// The account was opened with a zero balance.
    Created,
    /// Money was added.
    Deposited {
        /// Amount in minor units.
        amount: u64,
    },
    /// Money was taken out.
    Withdrawn {
        /// Amount in minor units.
        amount: u64,
    },
    /// The account was closed.
    Closed,
}

impl AccountEvent {
    /// Variant name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Deposited { .. } => "Deposited",
            Self::Withdrawn { .. } => "Withdrawn",
            Self::Closed => "Closed",
        }
    }
}

impl EntityState<AccountEvent> for AccountState {
    fn apply(&self, event: &AccountEvent) -> Result<Self, InvalidTransition> {
        let invalid = || InvalidTransition::new(self.name(), event.name());
        match (self, event) {
            (Self::Uninitialized, AccountEvent::Created) => Ok(Self::Active { balance: 0 }),
            (Self::Active { balance }, AccountEvent::Deposited { amount }) => balance
                .checked_add(*amount)
                .map(|balance| Self::Active { balance })
                .ok_or_else(invalid),
            (Self::Active { balance }, AccountEvent::Withdrawn { amount }) => balance
                .checked_sub(*amount)
                .map(|balance| Self::Active { balance })
                .ok_or_else(invalid),
            (Self::Active { .. }, AccountEvent::Closed) => Ok(Self::Closed),
            (Self::Uninitialized, _) | (Self::Active { .. }, _) | (Self::Closed, _) => {
                Err(invalid())
            }
        }
    }
}

/// What an account answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountReply {
    /// The command was accepted.
    Confirmed,
    /// The command was refused; nothing was persisted.
    Rejected(String),
    /// Answer to [`AccountCommand::GetBalance`].
    CurrentBalance(u64),
}

/// Requests an account accepts. Each expects an [`AccountReply`].
#[derive(Debug)]
pub enum AccountCommand {
    /// Open the account.
    CreateAccount {
        /// Recipient of the reply.
        reply_to: ReplyTo<AccountReply>,
    },
    /// Add `amount` to the balance.
    Deposit {
        /// Amount in minor units; must be positive.
        amount: u64,
        /// Recipient of the reply.
        reply_to: ReplyTo<AccountReply>,
    },
    /// Take `amount` from the balance.
    Withdraw {
        /// Amount in minor units; must be positive and covered.
        amount: u64,
        /// Recipient of the reply.
        reply_to: ReplyTo<AccountReply>,
    },
    /// Report the balance.
    GetBalance {
        /// Recipient of the reply.
        reply_to: ReplyTo<AccountReply>,
    },
    /// Close the account; the balance must be zero.
    CloseAccount {
        /// Recipient of the reply.
        reply_to: ReplyTo<AccountReply>,
    },
}

impl ExpectingReply for AccountCommand {
    type Reply = AccountReply;

    fn reply_to(&self) -> &ReplyTo<AccountReply> {
        match self {
            Self::CreateAccount { reply_to }
            | Self::Deposit { reply_to, .. }
            | Self::Withdraw { reply_to, .. }
            | Self::GetBalance { reply_to }
            | Self::CloseAccount { reply_to } => reply_to,
        }
    }
}

/// The account entity.
#[derive(Debug)]
pub struct AccountEntity;

impl EventSourcedEntity for AccountEntity {
    const ENTITY_TYPE: &'static str = "account";

    type Command = AccountCommand;
    type Event = AccountEvent;
    type State = AccountState;
    type Effect = AccountEffect;

    fn empty_state() -> AccountState {
        AccountState::Uninitialized
    }

    fn handle_command(state: &AccountState, command: AccountCommand) -> AccountEffect {
        match *state {
            AccountState::Uninitialized => uninitialized(command),
            AccountState::Active { balance } => active(balance, command),
            AccountState::Closed => rejected_unhandled(&command, "Account is closed"),
        }
    }
}

fn uninitialized(command: AccountCommand) -> AccountEffect {
    match command {
        AccountCommand::CreateAccount { .. } => {
            Effect::persist(AccountEvent::Created).then_reply(&command, |_| AccountReply::Confirmed)
        }
        AccountCommand::Deposit { .. }
        | AccountCommand::Withdraw { .. }
        | AccountCommand::GetBalance { .. }
        | AccountCommand::CloseAccount { .. } => {
            rejected_unhandled(&command, "Account has not been created")
        }
    }
}

fn active(balance: u64, command: AccountCommand) -> AccountEffect {
    match command {
        AccountCommand::CreateAccount { .. } => {
            rejected_unhandled(&command, "Account already exists")
        }
        AccountCommand::Deposit { amount: 0, .. } | AccountCommand::Withdraw { amount: 0, .. } => {
            reject(&command, "Amount must be greater than zero")
        }
        AccountCommand::Deposit { amount, .. } => {
            if balance.checked_add(amount).is_none() {
                return reject(
                    &command,
                    format!("Deposit of {amount} would overflow balance {balance}"),
                );
            }
            Effect::persist(AccountEvent::Deposited { amount })
                .then_reply(&command, |_| AccountReply::Confirmed)
        }
        AccountCommand::Withdraw { amount, .. } => {
            if amount > balance {
                return reject(
                    &command,
                    format!("Insufficient balance {balance} to be able to withdraw {amount}"),
                );
            }
            Effect::persist(AccountEvent::Withdrawn { amount })
                .then_reply(&command, |_| AccountReply::Confirmed)
        }
        AccountCommand::GetBalance { .. } => {
            Effect::reply(&command, AccountReply::CurrentBalance(balance))
        }
        AccountCommand::CloseAccount { .. } => {
            if balance != 0 {
                return reject(&command, "Can't close account with non-zero balance");
            }
            Effect::persist(AccountEvent::Closed).then_reply(&command, |_| AccountReply::Confirmed)
        }
    }
}

/// Validation failure: handled, nothing persisted.
fn reject(command: &AccountCommand, reason: impl Into<String>) -> AccountEffect {
    Effect::reply(command, AccountReply::Rejected(reason.into()))
}

/// The current state does not handle `command`; the caller still hears why.
fn rejected_unhandled(command: &AccountCommand, reason: &'static str) -> AccountEffect {
    Effect::unhandled().then_reply(command, move |_| AccountReply::Rejected(reason.into()))
}
