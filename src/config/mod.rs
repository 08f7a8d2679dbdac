//! Configuration for upsertree stores and flushes.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (upsertree.toml)
//! ```toml
//! [store]
//! data_dir = "/var/lib/upsertree"
//! create_if_missing = true
//!
//! [flush]
//! max_placeholders = 65535
//! ```
//!
//! Environment variables use the `UPSERTREE_` prefix with `__` between
//! sections, e.g. `UPSERTREE_STORE__DATA_DIR`.

mod defaults;

pub use defaults::*;

use crate::batch::BatchLimits;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsertConfig {
    /// Persistent store settings
    pub store: StoreConfig,
    /// Flush settings
    pub flush: FlushConfig,
}

impl UpsertConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(UpsertConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Store acquisition settings, handed to the connector explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the RocksDB database
    pub data_dir: PathBuf,
    /// Create the database on first connect
    pub create_if_missing: bool,
    /// Run repair before opening
    pub repair: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            create_if_missing: true,
            repair: false,
        }
    }
}

impl StoreConfig {
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }
}

/// Flush settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Maximum bound values per insert statement
    pub max_placeholders: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_placeholders: DEFAULT_MAX_PLACEHOLDERS,
        }
    }
}

impl FlushConfig {
    pub fn limits(&self) -> BatchLimits {
        BatchLimits::with_max_placeholders(self.max_placeholders)
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<FlushOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_if_missing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_placeholders: Option<usize>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpsertConfig::default();
        assert_eq!(config.flush.max_placeholders, DEFAULT_MAX_PLACEHOLDERS);
        assert_eq!(config.store.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert!(config.store.create_if_missing);
    }

    #[test]
    fn test_file_and_overrides_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "upsertree.toml",
                r#"
                [store]
                data_dir = "/tmp/from-file"

                [flush]
                max_placeholders = 1000
                "#,
            )?;

            let overrides = ConfigOverrides {
                flush: Some(FlushOverrides {
                    max_placeholders: Some(10),
                }),
                ..Default::default()
            };
            let config = UpsertConfig::load(Some("upsertree.toml"), overrides)
                .map_err(|e| e.to_string())?;

            assert_eq!(config.store.data_dir, PathBuf::from("/tmp/from-file"));
            assert_eq!(config.flush.max_placeholders, 10);
            assert!(config.store.create_if_missing);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("upsertree.toml", "[flush]\nmax_placeholders = 1000\n")?;
            jail.set_env("UPSERTREE_FLUSH__MAX_PLACEHOLDERS", "500");

            let config = UpsertConfig::from_env(Some("upsertree.toml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.flush.max_placeholders, 500);
            assert_eq!(config.flush.limits().rows_per_statement(5), Some(100));
            Ok(())
        });
    }
}
