//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::storage::{ChunkPolicy, CompressionType, EngineConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Zarr store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_compression")]
    pub compression: CompressionType,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("idstensor").to_string_lossy().to_string())
        .unwrap_or_else(|| "./idstensor_data".to_string())
}

fn default_compression() -> CompressionType {
    CompressionType::Zstd
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            compression: default_compression(),
        }
    }
}

impl StoreConfig {
    /// Data directory with a leading `~/` expanded
    pub fn data_path(&self) -> PathBuf {
        match (self.data_dir.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.data_dir),
        }
    }
}

/// Tensor engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget_bytes: usize,

    #[serde(default = "default_min_field_chunk")]
    pub min_field_chunk: usize,

    #[serde(default = "default_max_open_handles")]
    pub max_open_handles: usize,

    #[serde(default = "default_chunk_cache")]
    pub chunk_cache_bytes: usize,

    #[serde(default = "default_warn_on_shape_mismatch")]
    pub warn_on_shape_mismatch: bool,
}

fn default_chunk_budget() -> usize {
    2 * 1024 * 1024 // 2 MB
}

fn default_min_field_chunk() -> usize {
    10
}

fn default_max_open_handles() -> usize {
    4096
}

fn default_chunk_cache() -> usize {
    5 * 1024 * 1024 // 5 MB
}

fn default_warn_on_shape_mismatch() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_budget_bytes: default_chunk_budget(),
            min_field_chunk: default_min_field_chunk(),
            max_open_handles: default_max_open_handles(),
            chunk_cache_bytes: default_chunk_cache(),
            warn_on_shape_mismatch: default_warn_on_shape_mismatch(),
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

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
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
            Some(PathBuf::from("./idstensor.toml")),
            dirs::config_dir().map(|p| p.join("idstensor").join("config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Store overrides
        if let Ok(data_dir) = std::env::var("IDSTENSOR_DATA_DIR") {
            self.store.data_dir = data_dir;
        }
        if let Ok(compression) = std::env::var("IDSTENSOR_COMPRESSION") {
            match compression.to_lowercase().as_str() {
                "none" => self.store.compression = CompressionType::None,
                "gzip" => self.store.compression = CompressionType::Gzip,
                "zstd" => self.store.compression = CompressionType::Zstd,
                other => tracing::warn!("Ignoring unknown IDSTENSOR_COMPRESSION {:?}", other),
            }
        }

        // Engine overrides
        if let Ok(budget) = std::env::var("IDSTENSOR_CHUNK_BUDGET") {
            if let Ok(b) = budget.parse() {
                self.engine.chunk_budget_bytes = b;
            }
        }
        if let Ok(handles) = std::env::var("IDSTENSOR_MAX_HANDLES") {
            if let Ok(h) = handles.parse() {
                self.engine.max_open_handles = h;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("IDSTENSOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("IDSTENSOR_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Runtime engine configuration
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk: ChunkPolicy {
                budget_bytes: self.engine.chunk_budget_bytes,
                min_field_chunk: self.engine.min_field_chunk,
            },
            max_open_handles: self.engine.max_open_handles,
            chunk_cache_bytes: self.engine.chunk_cache_bytes,
            warn_on_shape_mismatch: self.engine.warn_on_shape_mismatch,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# idstensor Configuration
#
# Environment variables override these settings:
# - IDSTENSOR_DATA_DIR
# - IDSTENSOR_COMPRESSION
# - IDSTENSOR_CHUNK_BUDGET
# - IDSTENSOR_MAX_HANDLES
# - IDSTENSOR_LOG_LEVEL
# - IDSTENSOR_LOG_FORMAT

[store]
# Root of the Zarr hierarchy, one group per record
data_dir = "~/.local/share/idstensor"

# Chunk compression: none, gzip or zstd
compression = "zstd"

[engine]
# Upper bound on the bytes of one chunk
chunk_budget_bytes = 2097152

# Smallest chunk extent along a field axis
min_field_chunk = 10

# Cached dataset handles per action (fields and shape records each)
max_open_handles = 4096

# Chunk cache hint recorded on new field datasets (bytes)
chunk_cache_bytes = 5242880

# Warn when LINEAR interpolation falls back to the lower slice
warn_on_shape_mismatch = true

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_template_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.store.compression, CompressionType::Zstd);
        assert_eq!(config.engine.chunk_budget_bytes, 2 * 1024 * 1024);
        assert_eq!(config.engine.max_open_handles, 4096);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idstensor.toml");
        std::fs::write(&path, "[engine]\nmin_field_chunk = 4\n\n[store]\ncompression = \"none\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.min_field_chunk, 4);
        assert_eq!(config.engine.chunk_cache_bytes, 5 * 1024 * 1024);
        assert_eq!(config.store.compression, CompressionType::None);

        let engine = config.to_engine_config();
        assert_eq!(engine.chunk.min_field_chunk, 4);
        assert!(engine.warn_on_shape_mismatch);
    }

    #[test]
    fn test_shape_mismatch_warning_can_be_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idstensor.toml");
        std::fs::write(&path, "[engine]\nwarn_on_shape_mismatch = false\n\n[store]\ncompression = \"gzip\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.compression, CompressionType::Gzip);
        assert!(!config.engine.warn_on_shape_mismatch);
        assert!(!config.to_engine_config().warn_on_shape_mismatch);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[engine\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(&dir.path().join("absent.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_data_path_expands_home() {
        let store = StoreConfig {
            data_dir: "/tmp/idstensor".into(),
            compression: CompressionType::None,
        };
        assert_eq!(store.data_path(), PathBuf::from("/tmp/idstensor"));
        if let Some(home) = dirs::home_dir() {
            let store = StoreConfig {
                data_dir: "~/records".into(),
                compression: CompressionType::None,
            };
            assert_eq!(store.data_path(), home.join("records"));
        }
    }
}
