use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod http_directory;
mod output;

use commands::account::LoginArgs;
use output::Output;

#[derive(Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "End-to-end encrypted messaging client with offline delivery")]
struct Cli {
    /// Output in JSON format (for scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/courier)
    #[arg(long, global = true, env = "COURIER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in as a user on this device and publish its keys
    Login {
        /// User id
        user_id: String,
        /// Device id of this installation
        #[arg(short, long, default_value = "1")]
        device: u32,
        /// Bearer token for the message server and API
        #[arg(short, long, env = "COURIER_TOKEN")]
        token: Option<String>,
        /// WebSocket URL of the message server
        #[arg(long)]
        server: Option<String>,
        /// Base URL of the HTTP API
        #[arg(long)]
        api: Option<String>,
    },

    /// Log out and wipe all local data
    Logout,

    /// Show the current account
    Whoami,

    /// Send a message to a peer
    Send {
        /// Peer user id
        peer: String,
        /// Message text
        message: String,
        /// Target a specific device instead of the lowest one
        #[arg(short, long)]
        device: Option<u32>,
        /// Seconds to wait for delivery before leaving the message queued
        #[arg(short, long, default_value = "10")]
        wait: u64,
    },

    /// Show messages of a conversation
    Read {
        /// Peer user id or conversation id
        target: String,
        /// Maximum number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Mark every message of a conversation as read
    MarkRead {
        /// Peer user id or conversation id
        target: String,
    },

    /// Queue a failed or stuck message again
    Retry {
        /// Peer user id or conversation id
        target: String,
        /// Message id
        message_id: String,
        /// Seconds to wait for delivery
        #[arg(short, long, default_value = "10")]
        wait: u64,
    },

    /// Stay connected and print incoming messages
    Listen {
        /// Only this peer or conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output::new(cli.json);

    if let Err(e) = run(cli, &output).await {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not find data directory")?
            .join("courier"),
    };
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    let mut config = config::Config::load(&data_dir)?;

    match cli.command {
        Commands::Login {
            user_id,
            device,
            token,
            server,
            api,
        } => {
            let args = LoginArgs {
                user_id,
                device_id: device,
                token,
                server_url: server,
                api_url: api,
            };
            commands::account::login(args, &mut config, &data_dir, output).await
        }
        Commands::Logout => commands::account::logout(&mut config, &data_dir, output).await,
        Commands::Whoami => commands::account::whoami(&mut config, &data_dir, output).await,
        Commands::Send {
            peer,
            message,
            device,
            wait,
        } => {
            commands::message::send(
                &peer,
                &message,
                device,
                Duration::from_secs(wait),
                &mut config,
                &data_dir,
                output,
            )
            .await
        }
        Commands::Read { target, limit } => {
            commands::message::read(&target, limit, &mut config, &data_dir, output).await
        }
        Commands::MarkRead { target } => {
            commands::message::mark_read(&target, &mut config, &data_dir, output).await
        }
        Commands::Retry {
            target,
            message_id,
            wait,
        } => {
            commands::message::retry(
                &target,
                &message_id,
                Duration::from_secs(wait),
                &mut config,
                &data_dir,
                output,
            )
            .await
        }
        Commands::Listen { conversation } => {
            commands::message::listen(conversation.as_deref(), &mut config, &data_dir, output)
                .await
        }
    }
}
