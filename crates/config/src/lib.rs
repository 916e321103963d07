//! Layered configuration for folio.
//!
//! Sources are merged in increasing priority:
//!
//! 1. Built-in defaults.
//! 2. The user config file, `config.toml` in the platform config directory.
//! 3. An explicit file (`--config`), parsed by extension: TOML, YAML or JSON.
//! 4. Environment variables prefixed `FOLIO_`, nested with `__`
//!    (`FOLIO_ASSETS__MAX_CONCURRENT_FETCHES=8`).
//!
//! The merged result is validated once; errors name the offending key.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use folio_assets::DEFAULT_MAX_CONCURRENT;
use folio_ledger::RefreshPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "FOLIO_";
const DATABASE_FILENAME: &str = "folio.sqlite3";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "folio")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub assets: AssetsConfig,
    pub ledger: LedgerConfig,
    pub progress: ProgressConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        let dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".folio"));
        Self { path: dir.join(DATABASE_FILENAME) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Upper bound on cover fetches in flight at once.
    pub max_concurrent_fetches: usize,
}
impl Default for AssetsConfig {
    fn default() -> Self {
        Self { max_concurrent_fetches: DEFAULT_MAX_CONCURRENT }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Refresh policy for batches that do not choose their own.
    pub refresh: RefreshPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub enabled: bool,
    /// Events buffered per subscriber before the slowest one starts skipping.
    pub channel_capacity: usize,
}
impl Default for ProgressConfig {
    fn default() -> Self {
        Self { enabled: true, channel_capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
}
impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Config {
    /// Load from the default sources.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = explicit {
            loader = loader.file(path);
        }
        loader.load()
    }

    pub fn validate(&self) -> Result<()> {
        if self.assets.max_concurrent_fetches == 0 {
            exn::bail!(ErrorKind::Invalid("assets.max_concurrent_fetches must be at least 1".to_string()));
        }
        if self.progress.channel_capacity == 0 {
            exn::bail!(ErrorKind::Invalid("progress.channel_capacity must be at least 1".to_string()));
        }
        if self.log.level.trim().is_empty() {
            exn::bail!(ErrorKind::Invalid("log.level must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Builder over the config sources, mostly so tests can isolate them.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_file: Option<PathBuf>,
    explicit: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            user_file: project_dirs().map(|dirs| dirs.config_dir().join("config.toml")),
            explicit: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Merge this file over the user config. Unlike the user config, it must exist.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    /// Skip the user config file. A missing user config is never an error, so
    /// this is only needed to keep the host's file out of the result.
    pub fn without_user_file(mut self) -> Self {
        self.user_file = None;
        self
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn figment(&self) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(user_file) = &self.user_file {
            figment = figment.merge(Toml::file(user_file));
        }
        if let Some(path) = &self.explicit {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.clone()));
            }
            let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.clone())),
            };
        }
        Ok(figment.merge(Env::prefixed(&self.env_prefix).split("__")))
    }

    pub fn load(&self) -> Result<Config> {
        let config: Config = self.figment()?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(
            database = %config.database.path.display(),
            max_concurrent_fetches = config.assets.max_concurrent_fetches,
            refresh = %config.ledger.refresh,
            "Loaded configuration"
        );
        Ok(config)
    }
}
