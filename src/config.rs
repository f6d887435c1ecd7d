//! # Configuration
//!
//! Handles loading, parsing, and validation of TOML configuration files.
//! Searches multiple standard locations with a well-defined priority order,
//! then validates all paths and settings before returning.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Top-level configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub settings: Settings,
    pub backup: BTreeMap<String, BackupTarget>,
}

/// Global settings controlling backup, purge, and compact behavior.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Interval between backup cycles in seconds (used in watch mode).
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Block size in bytes for content-addressable chunking (default 100 KiB).
    #[serde(default = "default_blocksize")]
    pub blocksize: u64,

    /// Content digest algorithm identifier stored in each volume's manifest.
    #[serde(default = "default_block_hash")]
    pub block_hash: String,

    /// Whole-file digest algorithm identifier stored in each volume's manifest.
    #[serde(default = "default_file_hash")]
    pub file_hash: String,

    /// Compression algorithm: "zstd", "gzip", or "none".
    #[serde(default = "default_compression")]
    pub compression: CompressionKind,

    /// Zstd compression level (1-22, default 3).
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// Enable AES-256-GCM encryption. Requires a password to be set.
    #[serde(default)]
    pub encrypt: bool,

    /// Maximum number of snapshots to retain per target (0 = unlimited).
    #[serde(default)]
    pub max_snapshots: usize,

    /// Repository root directory for the catalog and local blob cache.
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,

    /// Purge/compact behavior defaults.
    #[serde(default)]
    pub purge: PurgeSettings,

    /// Opaque backend connection parameters. The storage core treats the
    /// backend as a `kind`-tagged bag of key/value strings; concrete
    /// transports (SFTP, S3, local filesystem, ...) interpret them.
    #[serde(default)]
    pub backend: BackendSettings,
}

/// Defaults governing automatic purge and compact behavior.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PurgeSettings {
    /// Run compact automatically after a purge that rewrote any fileset.
    #[serde(default = "default_true")]
    pub auto_compact: bool,

    /// Dblock volumes below this referenced-fraction are compact candidates.
    #[serde(default = "default_wasted_threshold")]
    pub wasted_threshold: f64,

    /// Dblock volumes wasting at least this many bytes are compact candidates,
    /// regardless of fraction.
    #[serde(default = "default_wasted_bytes_threshold")]
    pub wasted_bytes_threshold: u64,

    /// Skip the strict remote-list verification pass before purge/compact.
    #[serde(default)]
    pub no_backend_verification: bool,
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            auto_compact: default_true(),
            wasted_threshold: default_wasted_threshold(),
            wasted_bytes_threshold: default_wasted_bytes_threshold(),
            no_backend_verification: false,
        }
    }
}

/// Backend connection parameters (out of scope transport, held opaquely).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BackendSettings {
    /// Backend kind tag, e.g. "local", "s3", "sftp". Only "local" is
    /// implemented in this crate; others are represented only by the
    /// `ObjectStore` trait.
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// A single backup target mapping a source directory to a destination.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupTarget {
    /// Source directory to back up.
    pub from: PathBuf,

    /// Optional per-target compression override.
    pub compression: Option<CompressionKind>,

    /// Glob patterns to exclude from backup.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Supported compression backends.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Zstd,
    Gzip,
    None,
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionKind::Zstd => write!(f, "zstd"),
            CompressionKind::Gzip => write!(f, "gzip"),
            CompressionKind::None => write!(f, "none"),
        }
    }
}

fn default_interval() -> u64 {
    300
}
fn default_blocksize() -> u64 {
    100 * 1024
}
fn default_block_hash() -> String {
    "blake3".to_string()
}
fn default_file_hash() -> String {
    "blake3".to_string()
}
fn default_compression() -> CompressionKind {
    CompressionKind::Zstd
}
fn default_zstd_level() -> i32 {
    3
}
fn default_repo_path() -> PathBuf {
    PathBuf::from(".repocore")
}
fn default_true() -> bool {
    true
}
fn default_wasted_threshold() -> f64 {
    0.2
}
fn default_wasted_bytes_threshold() -> u64 {
    10 * 1024 * 1024
}
fn default_backend_kind() -> String {
    "local".to_string()
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/repocore.toml")];
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/repocore.toml")));
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/repocore.toml")));
    }
    paths.push(PathBuf::from("repocore.toml"));
    paths
}

/// Loads configuration from the first found config file in the search path.
pub fn load_config() -> Result<Config> {
    let search = config_search_paths();

    for path in &search {
        if path.exists() {
            return load_config_from(path);
        }
    }

    Err(ConfigError::NotFound { searched: search }.into())
}

/// Loads and validates configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;

    validate_config(&config)?;
    Ok(config)
}

/// Validates configuration invariants after parsing.
fn validate_config(config: &Config) -> std::result::Result<(), ConfigError> {
    if config.settings.interval == 0 {
        return Err(ConfigError::Validation {
            message: "interval must be greater than 0".to_string(),
        });
    }

    if config.settings.blocksize == 0 {
        return Err(ConfigError::Validation {
            message: "blocksize must be greater than 0".to_string(),
        });
    }

    if config.settings.zstd_level < 1 || config.settings.zstd_level > 22 {
        return Err(ConfigError::Validation {
            message: format!(
                "zstd_level must be between 1 and 22, got {}",
                config.settings.zstd_level
            ),
        });
    }

    if !(0.0..=1.0).contains(&config.settings.purge.wasted_threshold) {
        return Err(ConfigError::Validation {
            message: "purge.wasted_threshold must be between 0.0 and 1.0".to_string(),
        });
    }

    for (name, target) in &config.backup {
        if target.from.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("backup target '{name}' has empty 'from' path"),
            });
        }
    }

    Ok(())
}

/// Generates a default configuration file at the given path.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(anyhow::anyhow!("config file already exists: {}", path.display()).into());
    }

    let config = Config {
        settings: Settings {
            interval: 300,
            blocksize: default_blocksize(),
            block_hash: default_block_hash(),
            file_hash: default_file_hash(),
            compression: CompressionKind::Zstd,
            zstd_level: 3,
            encrypt: false,
            max_snapshots: 0,
            repo_path: PathBuf::from(".repocore"),
            purge: PurgeSettings::default(),
            backend: BackendSettings::default(),
        },
        backup: BTreeMap::from([(
            "documents".to_string(),
            BackupTarget {
                from: PathBuf::from("/home/user/Documents"),
                compression: None,
                exclude: vec!["*.tmp".to_string(), "*.cache".to_string()],
            },
        )]),
    };

    let toml_str = toml::to_string_pretty(&config)
        .map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml_str)?;

    Ok(())
}
