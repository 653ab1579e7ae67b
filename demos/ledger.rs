//! Walks one account through its lifecycle on a JSONL journal.
//!
//! Run with: `cargo run --example ledger`
//!
//! Set `RUST_LOG=eventfold_effects=debug` to see the actor and journal
//! logs.

use std::sync::Arc;

use eventfold_effects::ledger::{AccountCommand, AccountEntity, AccountReply};
use eventfold_effects::{EntityStore, JsonlJournal, PersistenceId, ReplyTo};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;
    let store = EntityStore::builder()
        .entity::<AccountEntity>(Arc::new(JsonlJournal::new(dir.path())))
        .build();

    let steps: Vec<(&str, fn(ReplyTo<AccountReply>) -> AccountCommand)> = vec![
        ("create", |reply_to| AccountCommand::CreateAccount { reply_to }),
        ("deposit 100", |reply_to| AccountCommand::Deposit {
            amount: 100,
            reply_to,
        }),
        ("withdraw 150", |reply_to| AccountCommand::Withdraw {
            amount: 150,
            reply_to,
        }),
        ("withdraw 100", |reply_to| AccountCommand::Withdraw {
            amount: 100,
            reply_to,
        }),
        ("balance", |reply_to| AccountCommand::GetBalance { reply_to }),
        ("close", |reply_to| AccountCommand::CloseAccount { reply_to }),
        ("deposit 5", |reply_to| AccountCommand::Deposit {
            amount: 5,
            reply_to,
        }),
    ];

    for (label, make) in steps {
        let reply = store.ask::<AccountEntity, _>("acc-1", make).await?;
        println!("{label:<13} -> {reply:?}");
    }

    let id = PersistenceId::of::<AccountEntity>("acc-1");
    let path = JsonlJournal::new(dir.path()).stream_path(&id);
    let history = std::fs::read_to_string(path)?;
    println!("\njournal:\n{history}");
    Ok(())
}
