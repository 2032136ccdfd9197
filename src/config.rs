//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::affinity::NodeRole;
use crate::cluster::ClusterConfig;
use crate::pipeline::DEFAULT_CELL_SIZE;
use crate::storage::{CleaveLimits, IndexGeometry, StoreConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where segment blobs are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    File,
}

/// Segment store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_tier")]
    pub tier: TierKind,

    #[serde(default = "default_segment_pass_count_limit")]
    pub segment_pass_count_limit: usize,

    #[serde(default = "default_per_cell_pass_limit")]
    pub per_cell_pass_limit: usize,

    #[serde(default = "default_true")]
    pub cleave_on_ingest: bool,

    #[serde(default = "default_true")]
    pub compress_blobs: bool,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("groundwork").to_string_lossy().to_string())
        .unwrap_or_else(|| "./groundwork_data".to_string())
}

fn default_tier() -> TierKind {
    TierKind::Memory
}

fn default_segment_pass_count_limit() -> usize {
    10_000_000
}

fn default_per_cell_pass_limit() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl StorageConfig {
    /// `data_dir` with a leading `~` resolved against the home directory
    pub fn data_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tier: default_tier(),
            segment_pass_count_limit: default_segment_pass_count_limit(),
            per_cell_pass_limit: default_per_cell_pass_limit(),
            cleave_on_ingest: default_true(),
            compress_blobs: default_true(),
        }
    }
}

/// Spatial index shape
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_levels")]
    pub levels: u8,

    /// Tiles are 2^dimension_bits cells on a side
    #[serde(default = "default_dimension_bits")]
    pub dimension_bits: u8,
}

fn default_levels() -> u8 {
    6
}

fn default_dimension_bits() -> u8 {
    5
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            dimension_bits: default_dimension_bits(),
        }
    }
}

/// In-process cluster shape
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Nodes serving each division
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Role the cluster's nodes advertise and partitions are assigned to
    #[serde(default = "default_role")]
    pub role: NodeRole,
}

fn default_partition_count() -> u32 {
    16
}

fn default_replicas() -> u32 {
    1
}

fn default_role() -> NodeRole {
    NodeRole::Storage
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            replicas: default_replicas(),
            role: default_role(),
        }
    }
}

/// Query execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "default_max_pooled_leaves")]
    pub max_pooled_leaves_per_type: usize,

    /// Cell edge in metres
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_pooled_leaves() -> usize {
    64
}

fn default_cell_size() -> f64 {
    DEFAULT_CELL_SIZE
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_pooled_leaves_per_type: default_max_pooled_leaves(),
            cell_size: default_cell_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("groundwork").join("config.toml")),
            Some(PathBuf::from("/etc/groundwork/config.toml")),
            Some(PathBuf::from("./groundwork.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("GROUNDWORK_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        if let Some(partitions) = env_parse("GROUNDWORK_PARTITIONS") {
            self.cluster.partition_count = partitions;
        }
        if let Some(replicas) = env_parse("GROUNDWORK_REPLICAS") {
            self.cluster.replicas = replicas;
        }
        match std::env::var("GROUNDWORK_ROLE").as_deref() {
            Ok("storage") => self.cluster.role = NodeRole::Storage,
            Ok("query") => self.cluster.role = NodeRole::Query,
            Ok(other) => tracing::warn!("Ignoring unknown GROUNDWORK_ROLE {:?}", other),
            Err(_) => {}
        }

        if let Ok(level) = std::env::var("GROUNDWORK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("GROUNDWORK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Index geometry, rejecting shapes the address space cannot hold
    pub fn geometry(&self) -> Result<IndexGeometry, ConfigError> {
        IndexGeometry::new(self.index.levels, self.index.dimension_bits).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "index levels {} with {} bits per level do not fit a 31-bit cell space",
                self.index.levels, self.index.dimension_bits
            ))
        })
    }

    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        Ok(StoreConfig {
            geometry: self.geometry()?,
            limits: CleaveLimits::new(
                self.storage.segment_pass_count_limit,
                self.storage.per_cell_pass_limit,
            ),
            cleave_on_ingest: self.storage.cleave_on_ingest,
        })
    }

    pub fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        if self.cluster.partition_count == 0 {
            return Err(ConfigError::Invalid("partition_count must be positive".to_string()));
        }
        Ok(ClusterConfig {
            partition_count: self.cluster.partition_count,
            replicas: self.cluster.replicas.max(1),
            role: self.cluster.role,
            store: self.store_config()?,
            worker_threads: self.query.worker_threads,
            max_pooled_leaves_per_type: self.query.max_pooled_leaves_per_type,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Groundwork Configuration
#
# Environment variables override these settings:
# - GROUNDWORK_DATA_DIR
# - GROUNDWORK_PARTITIONS
# - GROUNDWORK_REPLICAS
# - GROUNDWORK_ROLE
# - GROUNDWORK_LOG_LEVEL
# - GROUNDWORK_LOG_FORMAT

[storage]
# Directory for segment blobs when tier = "file"; a leading ~ is expanded
data_dir = "~/.local/share/groundwork"

# Blob tier: memory or file
tier = "memory"

# Cleave a segment holding more passes than this
segment_pass_count_limit = 10000000

# Cleave a segment when any one cell holds more passes than this
per_cell_pass_limit = 10000

# Cleave over-limit segments as appends arrive
cleave_on_ingest = true

# LZ4-compress blobs written by the file tier
compress_blobs = true

[index]
# Tree depth, including the tile level
levels = 6

# Address bits per level; tiles are 2^bits cells on a side
dimension_bits = 5

[cluster]
# Number of spatial divisions
partition_count = 16

# Nodes serving each division; the first is primary
replicas = 1

# Role the cluster's nodes advertise: storage or query
role = "storage"

[query]
# Worker threads per node for partition execution
worker_threads = 4

# Pooled client leaves kept per measurement type
max_pooled_leaves_per_type = 64

# Cell edge length in metres
cell_size = 0.34

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/groundwork/groundwork.log"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_generated_config_parses() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.storage.tier, TierKind::Memory);
        assert_eq!(config.storage.per_cell_pass_limit, 10_000);
        assert_eq!(config.cluster.partition_count, 16);
        assert_eq!(config.query.cell_size, 0.34);

        let store = config.store_config().unwrap();
        assert_eq!(store.geometry, IndexGeometry::default());
        assert_eq!(store.limits, CleaveLimits::new(10_000_000, 10_000));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cluster]\npartition_count = 8\n\n[storage]\ntier = \"file\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.cluster.partition_count, 8);
        assert_eq!(config.cluster.replicas, 1);
        assert_eq!(config.storage.tier, TierKind::File);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_role_reaches_cluster_config() {
        let config = Config::parse("[cluster]\nrole = \"query\"\n").unwrap();
        assert_eq!(config.cluster.role, NodeRole::Query);
        assert_eq!(config.cluster_config().unwrap().role, NodeRole::Query);

        assert_eq!(Config::default().cluster_config().unwrap().role, NodeRole::Storage);
        assert!(Config::parse("[cluster]\nrole = \"archive\"\n").is_err());
    }

    #[test]
    fn test_data_dir_home_expansion() {
        let home = dirs::home_dir().unwrap();
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.storage.data_path(), home.join(".local/share/groundwork"));
        assert!(!config.storage.data_path().starts_with("~"));

        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("/srv/groundwork"), PathBuf::from("/srv/groundwork"));
        assert_eq!(expand_home("data/~x"), PathBuf::from("data/~x"));
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let config = Config::parse("[index]\nlevels = 8\ndimension_bits = 5\n").unwrap();
        assert!(matches!(config.store_config(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_toml_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage\n").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }
}
