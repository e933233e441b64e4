//! telesync CLI
//!
//! Command-line tools for the telesync telemetry engine.
//!
//! # Commands
//!
//! - `watch` - Connect to an endpoint and print updates as JSON lines
//! - `serve` - Run the reference telemetry endpoint
//! - `config` - Validate and print the effective engine configuration

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use telesync_engine::TransportKind;
use tracing_subscriber::EnvFilter;

/// telesync command-line tools.
#[derive(Parser)]
#[command(name = "telesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Transport selection on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Pull,
    Push,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Pull => TransportKind::Pull,
            TransportArg::Push => TransportKind::Push,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to an endpoint and print updates
    Watch {
        /// Engine configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Endpoint URL, overriding the configuration file
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Transport kind, overriding the configuration file
        #[arg(short, long, value_enum)]
        transport: Option<TransportArg>,

        /// Only print these topics (repeatable; default is all)
        #[arg(long = "topic")]
        topics: Vec<String>,
    },

    /// Run the reference telemetry endpoint
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Snapshot file (JSON) to serve
        #[arg(short, long)]
        fixture: Option<PathBuf>,

        /// Re-publish the snapshot to stream clients every N milliseconds
        #[arg(long)]
        tick_ms: Option<u64>,
    },

    /// Validate and print the effective configuration
    Config {
        /// Engine configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Watch {
            config,
            endpoint,
            transport,
            topics,
        } => {
            let config =
                commands::config::resolve(config.as_deref(), endpoint, transport.map(Into::into))?;
            commands::watch::run(config, &topics).await?;
        }
        Commands::Serve {
            bind,
            fixture,
            tick_ms,
        } => {
            commands::serve::run(bind, fixture.as_deref(), tick_ms).await?;
        }
        Commands::Config { config } => {
            commands::config::run(config.as_deref())?;
        }
        Commands::Version => {
            println!("telesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
