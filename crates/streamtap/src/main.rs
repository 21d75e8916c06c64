//! Streamtap daemon - annotating proxy for streamed chat completions

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use streamtap::config::Config;
use streamtap::error::Result;
use streamtap::proxy::ProxyServer;

/// Streamtap - chat-completion proxy with stream annotations and tracing
#[derive(Parser)]
#[command(name = "streamtap")]
#[command(about = "A chat-completion proxy that annotates streams and traces completed turns")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,streamtap=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        return Config::from_file(&path);
    }

    for path in Config::default_paths() {
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return Config::from_file(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Streamtap daemon");

    let config = load_config(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    ProxyServer::new(config).serve().await?;

    tracing::info!("Streamtap daemon stopped");
    Ok(())
}
