use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use server::{Config, Result, http, stdio};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolhost")]
#[command(about = "Serve command-backed tools over HTTP or stdio", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the tool configuration
    #[arg(short, long, default_value = "toolhost.toml", global = true)]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve tools over HTTP
    ServeHttp {
        /// Address to bind (overrides [http] bind)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Serve tools as JSON-RPC over stdin/stdout
    ServeStdio,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(&cli.config)?;
    let registry = Arc::new(config.registry()?);
    info!(config = %cli.config.display(), tools = registry.len(), "loaded tools");

    match cli.command {
        Commands::ServeHttp { bind } => {
            let bind = bind.unwrap_or_else(|| config.http.bind.clone());
            let listener = TcpListener::bind(&bind).await?;
            http::serve(listener, registry, shutdown_signal()).await?;
        }
        Commands::ServeStdio => {
            stdio::serve(registry, tokio::io::stdin(), tokio::io::stdout()).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the stdio protocol.
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
