//! shellgate - terminal session broker.
//!
//! Accepts WebSocket connections from browser terminals, authenticates
//! them, and binds each to a restricted shell inside a sandboxed container.
//! Sessions survive client disconnects for a grace period and are reclaimed
//! deterministically on timeout, container exit, or broker shutdown.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shellgate::broker::Broker;
use shellgate::config::Config;
use shellgate::container::docker::DockerCli;
use shellgate::supervisor;

#[derive(Parser, Debug)]
#[command(name = "shellgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the broker (the default when no subcommand is given)
    Serve,

    /// Validate the environment and print the effective configuration
    CheckConfig,
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "shellgate=debug,tower_http=debug"
    } else {
        "shellgate=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration errors are fatal and aggregate: every violation is
    // listed, not just the first.
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            init_tracing(config.debug);
            tracing::info!(port = config.port, "shellgate starting");
            let adapter = Arc::new(DockerCli::new(config.container.clone()));
            let broker = Broker::new(config, adapter);
            supervisor::run(broker).await
        }
        Commands::CheckConfig => {
            println!("{config:#?}");
            Ok(())
        }
    }
}
