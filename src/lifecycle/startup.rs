//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Build the middleware registry and the initial chain
//! - Start the config watcher when asked to
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listener binds last (traffic only when the chain is ready)

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::{load_config, watcher::ConfigWatcher, ConfigError};
use crate::http::middleware::{MiddlewareRegistry, RegistryError};
use crate::http::server::{HttpServer, ServerError};
use crate::lifecycle::{signals, Shutdown};
use crate::observability::logging;

/// Errors that stop the host from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("server: {0}")]
    Server(#[from] ServerError),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Load `config_path` and serve until a termination signal.
pub async fn run(config_path: &Path, watch: bool) -> Result<(), StartupError> {
    let config = load_config(config_path)?;
    logging::init(config.observability.log_format);

    tracing::info!(
        path = %config_path.display(),
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let registry = Arc::new(MiddlewareRegistry::with_builtins()?);
    let server = HttpServer::new(config.clone(), registry)?;

    // Keep the watcher alive for as long as the server runs.
    let (_watcher, config_updates) = if watch {
        let (watcher, updates) = ConfigWatcher::new(config_path);
        (Some(watcher.run()?), updates)
    } else {
        let (_, updates) = mpsc::unbounded_channel();
        (None, updates)
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(&shutdown);

    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
