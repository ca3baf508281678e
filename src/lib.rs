// Declare the modules
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod id;
pub mod lifecycle;
pub mod models;
pub mod state;
pub mod store;

pub use config::StoreConfig;
pub use engine::{MemoryEngine, OpenRequest, SqliteEngine};
pub use error::StoreError;
pub use gate::Readiness;
pub use models::{ChatRecord, ChatTurn, NewChatRecord};
pub use store::ChatStore;

use anyhow::{bail, Context, Result};
use state::AppState;

const USAGE: &str = "usage: chatdb <command>
  list                          list conversations, most recent first
  new <message>                 start a conversation
  show <id>                     print a conversation
  send <id> <message> [reply]   append a turn
  delete <id>                   delete a conversation";

/// Entry point of the `chatdb` binary.
pub fn run() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = StoreConfig::from_env().context("Failed to load store configuration")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let state = AppState::new(ChatStore::from_config(&config));
        let result = dispatch(&state, &args).await;
        // Teardown closes the connection whether or not the command succeeded.
        state.store.close().await;
        result
    })
}

async fn dispatch(state: &AppState, args: &[String]) -> Result<()> {
    let Some((command, rest)) = args.split_first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    match (command.as_str(), rest) {
        ("list", []) => {
            for record in commands::list_conversations(state).await.map_err(anyhow::Error::msg)? {
                println!("{}  {}  ({} turns)", record.id, record.chat_title, record.convo.len());
            }
        }
        ("new", words) if !words.is_empty() => {
            let record = commands::create_conversation(state, words.join(" "))
                .await
                .map_err(anyhow::Error::msg)?;
            println!("{}", record.id);
        }
        ("show", [id]) => match commands::get_conversation(state, id).await.map_err(anyhow::Error::msg)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => bail!("No conversation with id {}", id),
        },
        ("send", [id, query, reply @ ..]) => {
            let convo = commands::send_message(state, id, query.clone(), reply.to_vec())
                .await
                .map_err(anyhow::Error::msg)?;
            println!("{} turns", convo.len());
        }
        ("delete", [id]) => {
            commands::delete_conversation(state, id)
                .await
                .map_err(anyhow::Error::msg)?;
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}
