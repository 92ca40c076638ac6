use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::DISCOVERY_PORT;
use crate::registry::ExpiryPolicy;
use crate::transfer::constants::{
    ACK_INTERVAL_BYTES, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_FILE_SIZE, SOCKET_BUFFER_SIZE,
    TRANSFER_PORT,
};
use crate::transfer::hash::ChecksumAlgorithm;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lanshare";
const APP_NAME: &str = "lanshare";
const CONFIG_FILE: &str = "config.json";

/// Overrides the directory `config.json` is read from
pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";
pub const DOWNLOAD_DIR_ENV: &str = "LANSHARE_DOWNLOAD_DIR";
pub const DISPLAY_NAME_ENV: &str = "LANSHARE_DISPLAY_NAME";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name shown to other peers; the host name when unset
    pub display_name: Option<String>,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_addr: SocketAddr,
    pub broadcast_addr: SocketAddr,
    pub interval_ms: u64,
    pub stale_after_ms: u64,
    pub offline_after_ms: u64,
    pub remove_after_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DISCOVERY_PORT)),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)),
            interval_ms: 5_000,
            stale_after_ms: 10_000,
            offline_after_ms: 15_000,
            remove_after_ms: 60_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        // Keep the thresholds ordered even if the file says otherwise
        let stale_after = Duration::from_millis(self.stale_after_ms);
        let offline_after = Duration::from_millis(self.offline_after_ms).max(stale_after);
        let remove_after = Duration::from_millis(self.remove_after_ms).max(offline_after);
        ExpiryPolicy {
            stale_after,
            offline_after,
            remove_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub bind_addr: SocketAddr,
    pub download_dir: PathBuf,
    /// Chunk size proposed when sending
    pub chunk_size: usize,
    /// Largest chunk accepted when receiving
    pub max_chunk_size: usize,
    pub checksum: ChecksumAlgorithm,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// A session with no progress for this long fails with `Timeout`
    pub idle_timeout_ms: u64,
    /// How long an incoming offer waits for the user
    pub accept_timeout_ms: u64,
    pub progress_interval_ms: u64,
    /// Receiver acknowledges every this many bytes; 0 disables acks
    pub ack_interval_bytes: u64,
    pub max_concurrent_transfers: usize,
    pub max_inbound_per_peer: usize,
    pub max_outbound_per_peer: usize,
    pub max_file_size: u64,
    /// Accept offers without asking
    pub auto_accept: bool,
    /// SO_SNDBUF when sending, SO_RCVBUF on the listener; 0 keeps the OS default
    pub socket_buffer_size: usize,
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .or_else(|| directories::UserDirs::new().map(|dirs| dirs.home_dir().join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], TRANSFER_PORT)),
            download_dir: default_download_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            checksum: ChecksumAlgorithm::default(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            accept_timeout_ms: 60_000,
            progress_interval_ms: 250,
            ack_interval_bytes: ACK_INTERVAL_BYTES,
            max_concurrent_transfers: 4,
            max_inbound_per_peer: 1,
            max_outbound_per_peer: 1,
            max_file_size: MAX_FILE_SIZE,
            auto_accept: false,
            socket_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

impl AppConfig {
    /// Path of `config.json`, honouring `LANSHARE_CONFIG_DIR`
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load the config file, falling back to defaults, then apply env overrides
    pub fn load() -> Self {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::warn!("Ignoring config file: {:#}", e);
                    Self::default()
                }
            },
            _ => Self::default(),
        };
        config.apply_env();
        config
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(DOWNLOAD_DIR_ENV) {
            self.transfer.download_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var(DISPLAY_NAME_ENV) {
            let name = name.trim();
            if !name.is_empty() {
                self.display_name = Some(name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let json = r#"{ "transfer": { "chunk_size": 65536, "auto_accept": true } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transfer.chunk_size, 65536);
        assert!(config.transfer.auto_accept);
        assert_eq!(config.transfer.max_inbound_per_peer, 1);
        assert_eq!(config.transfer.bind_addr.port(), TRANSFER_PORT);
        assert_eq!(config.discovery, DiscoveryConfig::default());
        assert_eq!(config.display_name, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = AppConfig::default();
        config.display_name = Some("Study PC".to_string());
        config.transfer.checksum = ChecksumAlgorithm::Xxh3;

        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_expiry_policy_is_ordered() {
        let config = DiscoveryConfig {
            stale_after_ms: 10_000,
            offline_after_ms: 5_000,
            remove_after_ms: 1_000,
            ..Default::default()
        };
        let policy = config.expiry_policy();
        assert!(policy.stale_after <= policy.offline_after);
        assert!(policy.offline_after <= policy.remove_after);
    }
}
