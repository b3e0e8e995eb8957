//! Configuration File Watcher
//!
//! Emits a change event whenever the access-key file is rewritten with a valid
//! configuration. Invalid rewrites are logged and skipped.

use super::{Config, ConfigManager};
use crate::Result;
use anyhow::{bail, Context};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub config: Arc<Config>,
    pub timestamp: std::time::SystemTime,
    pub file_path: PathBuf,
}

/// Configuration file watcher
pub struct ConfigWatcher {
    config_path: PathBuf,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Create a new configuration watcher
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let (change_sender, _) = broadcast::channel(16);

        let sender_clone = change_sender.clone();
        let path_clone = config_path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => Self::handle_file_event(event, &path_clone, &sender_clone),
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        // Watch the directory: editors and atomic saves replace the file itself.
        let parent_dir = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => bail!("Configuration file has no parent directory: {}", config_path.display()),
        };
        watcher
            .watch(&parent_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory: {}", parent_dir.display()))?;
        info!("Started watching configuration directory: {}", parent_dir.display());

        Ok(Self {
            config_path,
            change_sender,
            _watcher: watcher,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> BroadcastStream<ConfigChangeEvent> {
        BroadcastStream::new(self.change_sender.subscribe())
    }

    /// Handle file system events
    fn handle_file_event(
        event: Event,
        config_path: &Path,
        sender: &broadcast::Sender<ConfigChangeEvent>,
    ) {
        debug!("File event: {:?}", event);

        let affects_config = event
            .paths
            .iter()
            .any(|path| path.file_name() == config_path.file_name());
        if !affects_config {
            return;
        }

        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {
                info!("Configuration file changed, reloading...");

                // Give the writer a moment to finish.
                std::thread::sleep(std::time::Duration::from_millis(100));

                match ConfigManager::load_from_file(config_path) {
                    Ok(new_config) => {
                        let event = ConfigChangeEvent {
                            config: Arc::new(new_config),
                            timestamp: std::time::SystemTime::now(),
                            file_path: config_path.to_path_buf(),
                        };
                        if let Err(e) = sender.send(event) {
                            warn!("No subscribers for config change event: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to reload configuration, keeping current config: {}", e);
                    }
                }
            }
            EventKind::Remove(_) => {
                warn!("Configuration file was removed: {}", config_path.display());
            }
            _ => {
                debug!("Ignoring file event type: {:?}", event.kind);
            }
        }
    }
}
