//! # Conduit Server
//!
//! Realtime resource-binding server: clients multiplex CRUD requests and
//! change subscriptions for many streams over one websocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! conduit
//!
//! # Run with custom config
//! conduit --config /path/to/conduit.toml
//!
//! # Run with environment variables
//! CONDUIT_PORT=8080 CONDUIT_HOST=0.0.0.0 conduit
//! CONDUIT__LIMITS__REPLY_BUFFER=512 conduit
//! ```

mod bindings;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Realtime resource-binding server.
#[derive(Debug, Parser)]
#[command(name = "conduit", version, about)]
struct Args {
    /// Path to a TOML config file. Skips the default lookup paths.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit=debug,tenvis_conduit_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting Conduit server on {}:{} with {} binding(s)",
        config.host,
        config.port,
        config.bindings.len()
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_config_path() {
        Args::command().debug_assert();

        let none = Args::try_parse_from(["conduit"]).unwrap();
        assert_eq!(none.config, None);

        let spaced = Args::try_parse_from(["conduit", "--config", "conduit.toml"]).unwrap();
        assert_eq!(spaced.config, Some(PathBuf::from("conduit.toml")));

        let joined = Args::try_parse_from(["conduit", "--config=/etc/conduit.toml"]).unwrap();
        assert_eq!(joined.config, Some(PathBuf::from("/etc/conduit.toml")));

        assert!(Args::try_parse_from(["conduit", "--config"]).is_err());
        assert!(Args::try_parse_from(["conduit", "--port", "80"]).is_err());
    }
}
