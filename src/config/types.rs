//! Configuration Types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::management::types::ApiAuthConfig;

/// Access keys to serve. The reconcile input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default, alias = "Keys")]
    pub keys: Vec<AccessKeyConfig>,
}

/// One access key and the port it is served on.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessKeyConfig {
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,
    #[serde(alias = "Port")]
    pub port: u16,
    #[serde(alias = "Cipher")]
    pub cipher: String,
    #[serde(alias = "Secret")]
    pub secret: String,
}

impl fmt::Debug for AccessKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeyConfig")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Distinct ports named by the keys.
    pub fn ports(&self) -> BTreeSet<u16> {
        self.keys.iter().map(|key| key.port).collect()
    }

    /// Keys grouped by port, in configuration order within each port.
    pub fn keys_by_port(&self) -> BTreeMap<u16, Vec<&AccessKeyConfig>> {
        let mut by_port: BTreeMap<u16, Vec<&AccessKeyConfig>> = BTreeMap::new();
        for key in &self.keys {
            by_port.entry(key.port).or_default().push(key);
        }
        by_port
    }
}

/// What happens to relayed connections when their port stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Connections keep running until they end on their own.
    #[default]
    Drain,
    /// Connections are closed together with the listener.
    Abort,
}

impl FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(StopPolicy::Drain),
            "abort" => Ok(StopPolicy::Abort),
            other => Err(format!("unknown stop policy '{}', expected 'drain' or 'abort'", other)),
        }
    }
}

impl fmt::Display for StopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopPolicy::Drain => f.write_str("drain"),
            StopPolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Process settings. Not reloadable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    /// Access-key file, re-read on SIGHUP and rewritten by the admin API.
    pub config_path: PathBuf,
    pub admin_addr: SocketAddr,
    /// Address every port binding listens on.
    pub listen_ip: IpAddr,
    #[serde(with = "humantime_serde")]
    pub tcp_read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Salts remembered for replay detection. Zero disables the check.
    pub replay_history: usize,
    pub stop_policy: StopPolicy,
    /// Reload when the access-key file changes on disk.
    pub watch_config: bool,
    pub log_level: String,
    pub api_auth: ApiAuthConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.yml"),
            admin_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_read_timeout: Duration::from_secs(59),
            connect_timeout: Duration::from_secs(10),
            replay_history: 0,
            stop_policy: StopPolicy::Drain,
            watch_config: false,
            log_level: "info".to_string(),
            api_auth: ApiAuthConfig::default(),
        }
    }
}
