//! ironloop CLI entry point.
//!
//! Commands:
//! - `run`      Send one message and print the answer
//! - `chat`     Interactive chat, one session across turns
//! - `config`   Print the effective configuration

use clap::{Parser, Subcommand};
use std::process::ExitCode;

mod commands;

#[derive(Parser)]
#[command(
    name = "ironloop",
    about = "ironloop: multimodal LLM agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single message and print the final answer
    Run {
        /// The message to send
        #[arg(short, long)]
        message: String,

        /// Print answer text and tool activity as it streams
        #[arg(long)]
        stream: bool,

        /// Continue or name a session
        #[arg(long)]
        session: Option<String>,

        /// Override the model
        #[arg(long)]
        model: Option<String>,

        /// Override the provider
        #[arg(long)]
        provider: Option<String>,
    },

    /// Chat interactively; every turn shares one session
    Chat {
        /// Override the model
        #[arg(long)]
        model: Option<String>,

        /// Override the provider
        #[arg(long)]
        provider: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            message,
            stream,
            session,
            model,
            provider,
        } => {
            commands::agent::run(commands::agent::RunArgs {
                message,
                stream,
                session,
                model,
                provider,
            })
            .await
        }
        Commands::Chat { model, provider } => commands::agent::chat(model, provider).await,
        Commands::Config => commands::config_cmd::show().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
