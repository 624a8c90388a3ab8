//! Node configuration
//!
//! Stored as JSON at `<config dir>/lingodrive/config.json`. Every field has a
//! default, so a partial file (or none) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DriveError, DriveResult};
use crate::key;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// State database, block store and endpoint key live here
    pub data_dir: PathBuf,
    /// Root of the local mirrors, one subdirectory per drive
    pub snapshot_dir: PathBuf,
    /// Read when peer-to-peer mode is unavailable
    pub fallback_dir: PathBuf,
    pub p2p: P2pConfig,
    pub logging: LoggingConfig,
}

/// Peer-to-peer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// `false` forces local fallback
    pub enabled: bool,
    /// Serve replicated drives to other readers
    pub serve: bool,
    /// Extra endpoint ids (hex) to dial on every join
    pub bootstrap_peers: Vec<String>,
    pub join_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    pub discovery_window_secs: u64,
}

/// JSONL log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub jsonl: bool,
    pub logs_dir: PathBuf,
    /// Instance name in log file names and records
    pub instance: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serve: false,
            bootstrap_peers: Vec::new(),
            join_timeout_secs: 30,
            ready_timeout_secs: 60,
            discovery_window_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Config::default().logging
    }
}

impl P2pConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }

    /// Bootstrap peers decoded to endpoint ids.
    pub fn bootstrap_ids(&self) -> DriveResult<Vec<iroh::EndpointId>> {
        self.bootstrap_peers
            .iter()
            .map(|raw| {
                let bytes = key::validate(raw)?.require_drive_len()?;
                iroh::EndpointId::from_bytes(&bytes).map_err(|e| {
                    DriveError::Config(format!("bootstrap peer {}: {}", raw, e))
                })
            })
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_base(default_base_dir())
    }
}

impl Config {
    /// Defaults with every directory under `base`.
    pub fn with_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            data_dir: base.join("data"),
            snapshot_dir: base.join("mirror"),
            fallback_dir: base.join("fallback"),
            p2p: P2pConfig::default(),
            logging: LoggingConfig {
                jsonl: false,
                logs_dir: base.join("logs"),
                instance: "node".to_string(),
            },
        }
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lingodrive").join("config.json"))
    }

    /// Load from `path`, which must exist.
    pub fn load(path: &Path) -> DriveResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DriveError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| DriveError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load from `path` if given, else from the default location if present,
    /// else return defaults.
    pub fn load_or_default(path: Option<&Path>) -> DriveResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> DriveResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| DriveError::Serialization(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> DriveResult<()> {
        self.p2p
            .bootstrap_ids()
            .map_err(|e| DriveError::Config(format!("p2p.bootstrap_peers: {}", e)))?;

        for (name, secs) in [
            ("join_timeout_secs", self.p2p.join_timeout_secs),
            ("ready_timeout_secs", self.p2p.ready_timeout_secs),
        ] {
            if secs == 0 {
                return Err(DriveError::Config(format!("p2p.{} must be positive", name)));
            }
        }
        if self.logging.instance.trim().is_empty() {
            return Err(DriveError::Config("logging.instance is empty".to_string()));
        }
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.redb")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Mirror directory of one drive
    pub fn mirror_dir(&self, drive: &key::DriveKey) -> PathBuf {
        self.snapshot_dir.join(drive.to_hex())
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lingodrive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::with_base("/tmp/ld");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ld/data"));
        assert_eq!(config.p2p.join_timeout(), Duration::from_secs(30));
        assert_eq!(config.p2p.ready_timeout(), Duration::from_secs(60));
        assert_eq!(config.p2p.discovery_window(), Duration::from_secs(10));
        assert!(config.p2p.enabled);
        assert!(!config.p2p.serve);
        assert!(config.validate().is_ok());

        let drive = key::validate(&"ab".repeat(32)).unwrap();
        assert_eq!(
            config.mirror_dir(&drive),
            PathBuf::from("/tmp/ld/mirror").join("ab".repeat(32))
        );
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested/config.json");

        let mut config = Config::with_base(temp.path());
        config.p2p.serve = true;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{ "p2p": { "enabled": false } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.p2p.enabled);
        assert_eq!(config.p2p.ready_timeout_secs, 60);
    }

    #[test]
    fn test_rejects_bad_bootstrap_peer() {
        let mut config = Config::with_base("/tmp/ld");
        config.p2p.bootstrap_peers = vec!["deadbeef".to_string()];
        assert!(matches!(config.validate(), Err(DriveError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = Config::with_base("/tmp/ld");
        config.p2p.ready_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = tempfile::tempdir().unwrap();
        assert!(Config::load_or_default(Some(&temp.path().join("nope.json"))).is_err());
    }

    #[test]
    fn test_bootstrap_ids() {
        let peer = iroh::SecretKey::generate(&mut rand::rng()).public();
        let mut config = P2pConfig::default();
        config.bootstrap_peers = vec![hex::encode(peer.as_bytes()).to_uppercase()];
        assert_eq!(config.bootstrap_ids().unwrap(), vec![peer]);

        config.bootstrap_peers = vec!["abcd".to_string()];
        assert!(config.bootstrap_ids().is_err());
    }
}
