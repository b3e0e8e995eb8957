//! Configuration Module
//!
//! Access-key configuration, process settings and the config file watcher.

pub mod manager;
pub mod types;
pub mod watcher;

pub use manager::ConfigManager;
pub use types::*;
pub use watcher::{ConfigChangeEvent, ConfigWatcher};
