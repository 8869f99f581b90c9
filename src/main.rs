mod completion_client;
mod config;
mod relay;
mod transport;

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use eyre::Result;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::completion_client::CompletionClient;
use crate::config::{CompletionConfig, RelayConfig};
use crate::relay::ChatRelay;
use crate::relay::conversation_state::{ConversationStore, UserId};
use crate::transport::console::ConsoleSession;
use crate::transport::telegram::{self, TelegramApi};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Model identifier sent to the completion API
    #[arg(long, global = true)]
    model: Option<String>,

    /// Upper bound on tokens in each reply
    #[arg(long, global = true)]
    max_tokens: Option<u32>,

    /// Number of turns remembered per user
    #[arg(long, global = true)]
    history_limit: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Telegram bot (default)
    Serve,
    /// Chat with the bot from the terminal
    Chat {
        /// Question to ask instead of starting an interactive session
        #[arg(short, long)]
        input: Option<String>,

        /// User id the local session speaks as
        #[arg(long, default_value_t = 0)]
        user_id: UserId,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from .env file
    dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut completion_config = CompletionConfig::from_env()?;
    if let Some(model) = cli.model {
        completion_config.model = model;
    }
    if let Some(max_tokens) = cli.max_tokens {
        completion_config.max_tokens = max_tokens;
    }

    let mut relay_config = RelayConfig::from_env()?;
    if let Some(history_limit) = cli.history_limit {
        relay_config.history_limit = history_limit;
    }

    let gateway = Arc::new(CompletionClient::new(&completion_config)?);
    let store = Arc::new(ConversationStore::new(relay_config.history_limit));
    let relay = Arc::new(ChatRelay::new(store, gateway, relay_config.system_prompt));

    info!(
        model = %completion_config.model,
        max_tokens = completion_config.max_tokens,
        history_limit = relay.store().max_turns(),
        "Starting step tutor"
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let token = config::telegram_token_from_env()?;
            let api = Arc::new(TelegramApi::new(token)?);
            telegram::run(api, relay).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Chat { input, user_id } => {
            let mut session = ConsoleSession::new(Box::new(io::stdout()), input, relay, user_id);
            session.run().await
        }
    }
}
