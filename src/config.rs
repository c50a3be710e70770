//! Scheduler configuration.
//!
//! Sources are layered with figment: defaults, then an optional TOML file, then `NRS_`
//! environment variables (`NRS_TBF__DEFAULT_RATE=500` overrides `tbf.default_rate`).

use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TBF rate in requests per second.
pub const DEFAULT_TBF_RATE: u64 = 10_000;
/// Default TBF bucket depth in tokens.
pub const DEFAULT_TBF_DEPTH: u64 = 3;
/// Exclusive upper bound on any TBF rate.
pub const TBF_RATE_CEILING: u64 = 65_535;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to extract configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("configuration file not found: {0}")]
    MissingFile(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NrsConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub tbf: TbfConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl NrsConfig {
    /// Load defaults plus `NRS_` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config: NrsConfig = Figment::new()
            .merge(Env::prefixed("NRS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply `NRS_` environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.display().to_string()));
        }
        let config: NrsConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("NRS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: NrsConfig = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.partitions == 0 {
            return Err(ConfigError::Invalid(
                "service.partitions must be at least 1".into(),
            ));
        }
        if self.service.name.is_empty() {
            return Err(ConfigError::Invalid("service.name must not be empty".into()));
        }
        if self.tbf.default_rate == 0 || self.tbf.default_rate >= self.tbf.rate_ceiling {
            return Err(ConfigError::Invalid(format!(
                "tbf.default_rate must be in 1..{}, got {}",
                self.tbf.rate_ceiling, self.tbf.default_rate
            )));
        }
        if self.tbf.depth == 0 {
            return Err(ConfigError::Invalid("tbf.depth must be at least 1".into()));
        }
        Ok(())
    }
}

/// Service layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, matched by policy compatibility filters.
    pub name: String,
    /// Number of independent scheduling partitions.
    pub partitions: usize,
    /// Whether each partition also owns a high-priority head.
    pub high_priority: bool,
    /// Worker threads per partition (demo binary).
    pub workers_per_partition: usize,
    /// Pin each partition's workers to a CPU.
    pub pin_workers: bool,
    /// Worker scheduling priority: 0 normal, 1 round-robin, 2 and up FIFO real-time.
    pub worker_priority: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "ost_io".to_owned(),
            partitions: 2,
            high_priority: true,
            workers_per_partition: 2,
            pin_workers: false,
            worker_priority: 0,
        }
    }
}

/// How TBF derives the client key of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TbfClassifier {
    /// Source network identifier.
    #[default]
    Nid,
    /// Job identifier carried in the request.
    JobId,
}

/// Token bucket filter defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TbfConfig {
    pub classifier: TbfClassifier,
    /// Rate given to the default rule and to `start` commands without a rate.
    pub default_rate: u64,
    /// Bucket depth for every rule.
    pub depth: u64,
    /// Exclusive upper bound accepted by rule commands.
    pub rate_ceiling: u64,
}

impl Default for TbfConfig {
    fn default() -> Self {
        Self {
            classifier: TbfClassifier::Nid,
            default_rate: DEFAULT_TBF_RATE,
            depth: DEFAULT_TBF_DEPTH,
            rate_ceiling: TBF_RATE_CEILING,
        }
    }
}

/// Logging defaults for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Seconds between JSON snapshot log lines (0 disables them).
    pub snapshot_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "rpc_nrs=info".to_owned(),
            snapshot_interval_secs: 5,
        }
    }
}
