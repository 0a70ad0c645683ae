//! Tusk - resumable upload engine driver

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tusk_cli::{load_config, run, AppState, Command};

#[derive(Parser, Debug)]
#[command(name = "tusk")]
#[command(about = "Resumable chunked uploads into a storage tree")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "TUSK_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overrides the configured root
    #[arg(short, long, env = "TUSK_ROOT")]
    root: Option<PathBuf>,

    /// Defer blob storage to a later `finalize`
    #[arg(long = "async", env = "TUSK_ASYNC")]
    async_uploads: bool,

    /// Log bytes-received events
    #[arg(long, env = "TUSK_EVENTS")]
    events: bool,

    /// Enable debug logging
    #[arg(short, long, env = "TUSK_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logs go to stderr, command output to stdout
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("tusk_core={0},tusk_cli={0}", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(root) = args.root {
        config.root = root;
    }
    if args.async_uploads {
        config.async_uploads = true;
    }

    let state = AppState::open(config, args.events).await?;
    run(&state, args.command).await
}
