//! nexusd - Nexus messaging server daemon
//!
//! Binds the TCP listener, opens the message store, and serves until
//! interrupted. Configuration comes from a TOML file passed as the first
//! argument, from `NEXUSD_CONFIG`, or falls back to defaults.

use std::path::PathBuf;
use std::sync::Arc;

use directories::ProjectDirs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_core::{Config, Database};
use nexus_net::Server;

fn load_config() -> Config {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NEXUSD_CONFIG").ok())
        .map(PathBuf::from);

    let config = match path {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    config
}

fn database_path() -> PathBuf {
    let dirs = ProjectDirs::from("dev", "nexus", "nexusd");
    match dirs {
        Some(dirs) => {
            let dir = dirs.data_dir().to_path_buf();
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::error!("Failed to create data directory {}: {}", dir.display(), e);
                std::process::exit(1);
            }
            dir.join("messages.db")
        }
        None => PathBuf::from("messages.db"),
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting nexusd");

    let config = load_config();

    let db_path = database_path();
    let store = match Database::open(&db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("Failed to open database {}: {}", db_path.display(), e);
            std::process::exit(1);
        }
    };
    tracing::info!(path = %db_path.display(), "Message store open");

    let server = match Server::start(&config.server, store).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %server.addr(), "Serving");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down");
    server.shutdown();
}
