//! Configuration file watcher for hot reload.
//!
//! The parent directory is watched rather than the file itself, so editors
//! that save by writing a temporary file and renaming it over the original
//! keep triggering reloads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !touches(&event, &path) {
                        return;
                    }
                    tracing::info!("Config file change detected, reloading...");
                    match load_config(&path) {
                        Ok(new_config) => {
                            if tx.send(new_config).is_err() {
                                tracing::debug!("Config receiver gone, dropping update");
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "Failed to reload config, keeping current configuration"
                            );
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(watch_dir(&self.path), RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Directory holding `path`; a bare file name lives in the working directory.
fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Whether `event` leaves new content at `path`.
///
/// Removals are ignored: a replace-style save removes or renames the old
/// file and the matching create or rename-to event follows.
fn touches(event: &Event, path: &Path) -> bool {
    if !(event.kind.is_modify() || event.kind.is_create()) {
        return false;
    }
    let Some(name) = path.file_name() else {
        return false;
    };
    event.paths.iter().any(|p| p.file_name() == Some(name))
}
