//! Configuration Manager

use super::{Config, ServerSettings, StopPolicy};
use crate::error::ConfigParseError;
use crate::service::CipherKind;
use crate::Result;
use anyhow::{bail, Context};
use std::collections::HashSet;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Loads, validates and persists access-key configurations.
pub struct ConfigManager;

impl ConfigManager {
    /// Load and validate the access-key file.
    pub fn load_from_file(path: &Path) -> std::result::Result<Config, ConfigParseError> {
        tracing::debug!("Loading access keys from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_yaml(&content)
    }

    pub fn parse_yaml(content: &str) -> std::result::Result<Config, ConfigParseError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_json(content: &[u8]) -> std::result::Result<Config, ConfigParseError> {
        let config: Config = serde_json::from_slice(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write `config` as YAML. The file is replaced atomically so readers
    /// never observe a partial write.
    pub fn save_to_file(path: &Path, config: &Config) -> Result<()> {
        let content = serde_yaml::to_string(config).context("Failed to serialize access keys")?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        temp.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write access keys for {}", path.display()))?;
        // The temporary file is created 0600; keep the mode of the file it replaces.
        let permissions = match std::fs::metadata(path) {
            Ok(metadata) => Some(metadata.permissions()),
            Err(_) => new_file_permissions(),
        };
        if let Some(permissions) = permissions {
            temp.as_file()
                .set_permissions(permissions)
                .with_context(|| format!("Failed to set permissions for {}", path.display()))?;
        }
        temp.persist(path)
            .with_context(|| format!("Failed to replace config file: {}", path.display()))?;

        tracing::info!("Saved {} access keys to {}", config.keys.len(), path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn new_file_permissions() -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<std::fs::Permissions> {
    None
}

impl Config {
    /// Reject configurations that cannot be served.
    pub fn validate(&self) -> std::result::Result<(), ConfigParseError> {
        let mut seen = HashSet::new();
        for (i, key) in self.keys.iter().enumerate() {
            if key.id.is_empty() {
                return Err(ConfigParseError::Invalid(format!("key {} has an empty id", i)));
            }
            if !seen.insert(key.id.as_str()) {
                return Err(ConfigParseError::Invalid(format!("duplicate key id '{}'", key.id)));
            }
            if key.port == 0 {
                return Err(ConfigParseError::Invalid(format!("key '{}' has port 0", key.id)));
            }
            if key.secret.is_empty() {
                return Err(ConfigParseError::Invalid(format!("key '{}' has an empty secret", key.id)));
            }
            if key.cipher.parse::<CipherKind>().is_err() {
                return Err(ConfigParseError::UnknownCipher {
                    id: key.id.clone(),
                    cipher: key.cipher.clone(),
                });
            }
        }
        Ok(())
    }
}

impl ServerSettings {
    /// Defaults overridden by `PORTMUX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(path) = var("PORTMUX_CONFIG") {
            settings.config_path = PathBuf::from(path);
        }

        if let Some(addr) = var("PORTMUX_ADMIN_ADDR") {
            settings.admin_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid PORTMUX_ADMIN_ADDR: {}", addr))?;
        }

        if let Some(ip) = var("PORTMUX_LISTEN_IP") {
            settings.listen_ip = ip
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid PORTMUX_LISTEN_IP: {}", ip))?;
        }

        if let Some(timeout) = var("PORTMUX_TCP_READ_TIMEOUT") {
            settings.tcp_read_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PORTMUX_TCP_READ_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = var("PORTMUX_CONNECT_TIMEOUT") {
            settings.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PORTMUX_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(history) = var("PORTMUX_REPLAY_HISTORY") {
            settings.replay_history = history
                .parse::<usize>()
                .with_context(|| format!("Invalid PORTMUX_REPLAY_HISTORY: {}", history))?;
        }

        if let Some(policy) = var("PORTMUX_STOP_POLICY") {
            settings.stop_policy = policy
                .parse::<StopPolicy>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid PORTMUX_STOP_POLICY: {}", policy))?;
        }

        if let Some(watch) = var("PORTMUX_WATCH_CONFIG") {
            settings.watch_config = watch
                .parse::<bool>()
                .with_context(|| format!("Invalid PORTMUX_WATCH_CONFIG: {}", watch))?;
        }

        if let Some(log_level) = var("PORTMUX_LOG_LEVEL") {
            settings.log_level = log_level;
        }

        if let Some(api_key) = var("PORTMUX_API_KEY") {
            settings.api_auth.enabled = true;
            settings.api_auth.api_key = Some(api_key);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tcp_read_timeout.is_zero() {
            bail!("tcp_read_timeout must be greater than 0");
        }

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            bail!("log_level must be one of: {}", valid_log_levels.join(", "));
        }

        if self.api_auth.enabled && self.api_auth.api_key.is_none() && self.api_auth.basic_auth.is_none() {
            bail!("API auth is enabled but neither an API key nor basic auth is configured");
        }

        Ok(())
    }

    /// Merge with CLI arguments
    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        config_path: Option<PathBuf>,
        admin_addr: Option<SocketAddr>,
        listen_ip: Option<IpAddr>,
        tcp_read_timeout: Option<std::time::Duration>,
        connect_timeout: Option<std::time::Duration>,
        replay_history: Option<usize>,
        stop_policy: Option<StopPolicy>,
        watch_config: bool,
    ) {
        if let Some(path) = config_path {
            tracing::info!("CLI override: config path set to {}", path.display());
            self.config_path = path;
        }

        if let Some(addr) = admin_addr {
            self.admin_addr = addr;
            tracing::info!("CLI override: admin address set to {}", addr);
        }

        if let Some(ip) = listen_ip {
            self.listen_ip = ip;
            tracing::info!("CLI override: listen IP set to {}", ip);
        }

        if let Some(timeout) = tcp_read_timeout {
            self.tcp_read_timeout = timeout;
            tracing::info!("CLI override: TCP read timeout set to {:?}", timeout);
        }

        if let Some(timeout) = connect_timeout {
            self.connect_timeout = timeout;
            tracing::info!("CLI override: connect timeout set to {:?}", timeout);
        }

        if let Some(history) = replay_history {
            self.replay_history = history;
            tracing::info!("CLI override: replay history set to {}", history);
        }

        if let Some(policy) = stop_policy {
            self.stop_policy = policy;
            tracing::info!("CLI override: stop policy set to {}", policy);
        }

        if watch_config {
            self.watch_config = true;
            tracing::info!("CLI override: watching config file for changes");
        }
    }
}
