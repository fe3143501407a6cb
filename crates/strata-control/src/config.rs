//! Configuration for strata-control.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use strata_vault::VaultConfig;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Credential vault configuration.
    #[serde(default)]
    pub vault: VaultConfig,

    /// Provisioning engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Cost estimation configuration.
    #[serde(default)]
    pub cost: CostConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `strata.toml` in the current directory (if present)
    /// 3. Environment variables with `STRATA_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file("strata.toml")))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ControlResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    fn from_figment(figment: Figment) -> ControlResult<Self> {
        figment
            .merge(Env::prefixed("STRATA_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (`sqlite://path/to/file.db` or `sqlite::memory:`).
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database, in seconds.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl DatabaseConfig {
    /// File path named by the URL, or `None` for an in-memory database.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        let rest = self
            .url
            .strip_prefix("sqlite://")
            .or_else(|| self.url.strip_prefix("sqlite:"))
            .unwrap_or(&self.url);
        let rest = rest.split('?').next().unwrap_or(rest);

        if rest.is_empty() || rest == ":memory:" {
            None
        } else {
            Some(PathBuf::from(rest))
        }
    }

    /// Busy timeout as a duration.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

fn default_database_url() -> String {
    "sqlite://strata.db".to_owned()
}

const fn default_max_connections() -> u32 {
    5
}

const fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

/// Provisioning engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Which engine to run.
    #[serde(default)]
    pub kind: EngineKind,

    /// Path to the terraform binary.
    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: PathBuf,

    /// Parent directory for per-deployment working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Deadline for a single plan, apply or destroy, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long a cancelled engine call may take to wind down before it is
    /// aborted, in seconds.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_terraform_bin() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/strata/work")
}

const fn default_timeout_secs() -> u64 {
    1800 // 30 minutes
}

const fn default_cancel_grace_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            terraform_bin: default_terraform_bin(),
            work_dir: default_work_dir(),
            timeout_secs: default_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Type of provisioning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Terraform CLI.
    #[default]
    Terraform,

    /// In-process mock engine for testing.
    Mock,
}

/// Cost estimation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    /// Which estimator to use.
    #[serde(default)]
    pub kind: CostKind,

    /// ISO currency code reported with estimates.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Upper bound on one estimate, in seconds.
    #[serde(default = "default_cost_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_currency() -> String {
    "USD".to_owned()
}

const fn default_cost_timeout_secs() -> u64 {
    10
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            kind: CostKind::default(),
            currency: default_currency(),
            timeout_secs: default_cost_timeout_secs(),
        }
    }
}

/// Type of cost estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    /// Built-in price table.
    #[default]
    Static,

    /// No estimation.
    Disabled,
}
