//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! `FEDAGG__` prefix, sections and keys being separated by `__`. An example configuration file
//! can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::compression::{MAX_BITS, MIN_BITS};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub ledger: LedgerSettings,
    #[validate]
    pub compression: CompressionSettings,
    #[validate]
    pub aggregation: AggregationSettings,
    pub registry: RegistrySettings,
    #[validate]
    pub retry: RetrySettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("fedagg").prefix_separator("__").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round settings.
pub struct LedgerSettings {
    /// The number of accepted contributions a round needs to be aggregated.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [ledger]
    /// min_clients = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__LEDGER__MIN_CLIENTS=3
    /// ```
    #[validate(range(min = 1))]
    pub min_clients: usize,

    /// The time after opening during which a round accepts contributions, in seconds.
    ///
    /// A round that has not reached `min_clients` contributions when this period has passed is
    /// discarded.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [ledger]
    /// grace_period = 3600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__LEDGER__GRACE_PERIOD=3600
    /// ```
    #[validate(range(min = 1))]
    pub grace_period: u64,

    /// The interval at which rounds are checked for quorum and expiry, in milliseconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [ledger]
    /// poll_interval = 1000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__LEDGER__POLL_INTERVAL=1000
    /// ```
    #[serde(default = "default_poll_interval")]
    #[validate(range(min = 1))]
    pub poll_interval: u64,
}

fn default_poll_interval() -> u64 {
    1000
}

impl LedgerSettings {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period.min(i64::MAX as u64) as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval)
    }
}

#[derive(Debug, Validate, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[validate(schema(function = "validate_compression"))]
/// Compression settings handed to the clients together with the round parameters.
pub struct CompressionSettings {
    /// The fraction of the largest-magnitude entries of a delta that is kept. The value must be
    /// between `0` and `1` (i.e. `0 < top_k_fraction <= 1`).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [compression]
    /// top_k_fraction = 0.1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__COMPRESSION__TOP_K_FRACTION=0.1
    /// ```
    pub top_k_fraction: f64,

    /// The width of the quantization codes, between `2` and `32`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [compression]
    /// bits = 8
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__COMPRESSION__BITS=8
    /// ```
    pub bits: u8,
}

impl CompressionSettings {
    fn validate_compression(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts literals, therefore we check the ranges here
        if !(0. < self.top_k_fraction && self.top_k_fraction <= 1.) {
            return Err(ValidationError::new("invalid top-k fraction"));
        }
        if !(MIN_BITS..=MAX_BITS).contains(&self.bits) {
            return Err(ValidationError::new("invalid code width"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_compression(s: &CompressionSettings) -> Result<(), ValidationError> {
    s.validate_compression()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Aggregation settings.
pub struct AggregationSettings {
    /// The largest accepted L2 norm of the averaged delta. Aggregates with a larger norm are not
    /// published.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// max_delta_norm = 100.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__AGGREGATION__MAX_DELTA_NORM=100.0
    /// ```
    #[validate(range(min = 0.0))]
    pub max_delta_norm: f64,

    /// The number of threads used to decrypt contributions. `0` uses one thread per core.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// threads = 4
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__AGGREGATION__THREADS=4
    /// ```
    #[serde(default)]
    pub threads: usize,
}

#[derive(Debug, Deserialize, Clone)]
/// Model registry settings.
pub struct RegistrySettings {
    /// The directory holding the published model versions.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [registry]
    /// path = "/var/lib/fedagg/models"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__REGISTRY__PATH=/var/lib/fedagg/models
    /// ```
    pub path: PathBuf,

    /// The file holding the hex encoded secret key the registry signs artifacts with.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [registry]
    /// signing_key = "/etc/fedagg/registry.key"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__REGISTRY__SIGNING_KEY=/etc/fedagg/registry.key
    /// ```
    pub signing_key: PathBuf,

    /// The schema version of the published models.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [registry]
    /// schema_version = "1.0"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__REGISTRY__SCHEMA_VERSION=1.0
    /// ```
    pub schema_version: String,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq)]
#[validate(schema(function = "validate_retry"))]
/// Retry settings of the client update producer.
pub struct RetrySettings {
    /// The maximal number of submission attempts.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [retry]
    /// max_attempts = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__RETRY__MAX_ATTEMPTS=5
    /// ```
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// The delay before the first retry, in milliseconds.
    pub initial_delay: u64,

    /// The upper bound of the delay between two attempts, in milliseconds.
    pub max_delay: u64,

    /// The factor the delay grows by after every failed attempt.
    #[validate(range(min = 1.0))]
    pub multiplier: f64,

    /// The fraction of the delay that is randomized, between `0` and `1`.
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl RetrySettings {
    fn validate_retry(&self) -> Result<(), ValidationError> {
        if self.initial_delay <= self.max_delay {
            Ok(())
        } else {
            Err(ValidationError::new("initial delay exceeds maximal delay"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_retry(s: &RetrySettings) -> Result<(), ValidationError> {
    s.validate_retry()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: 200,
            max_delay: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAGG__LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Default for CompressionSettings {
        fn default() -> Self {
            Self {
                top_k_fraction: 0.1,
                bits: 8,
            }
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new(concat!(env!("CARGO_MANIFEST_DIR"), "/configs/config.toml")).is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_validate_compression() {
        assert!(CompressionSettings::default().validate().is_ok());

        let mut compression = CompressionSettings::default();
        compression.top_k_fraction = 0.;
        assert!(compression.validate().is_err());

        let mut compression = CompressionSettings::default();
        compression.top_k_fraction = 1.;
        assert!(compression.validate().is_ok());

        let mut compression = CompressionSettings::default();
        compression.top_k_fraction = 1.01;
        assert!(compression.validate().is_err());

        let mut compression = CompressionSettings::default();
        compression.bits = 1;
        assert!(compression.validate().is_err());

        let mut compression = CompressionSettings::default();
        compression.bits = 33;
        assert!(compression.validate().is_err());
    }

    #[test]
    fn test_validate_retry() {
        assert!(RetrySettings::default().validate().is_ok());

        let mut retry = RetrySettings::default();
        retry.max_attempts = 0;
        assert!(retry.validate().is_err());

        let mut retry = RetrySettings::default();
        retry.initial_delay = retry.max_delay + 1;
        assert!(retry.validate().is_err());

        let mut retry = RetrySettings::default();
        retry.jitter = 1.5;
        assert!(retry.validate().is_err());

        let mut retry = RetrySettings::default();
        retry.multiplier = 0.5;
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_validate_ledger() {
        let ledger = LedgerSettings {
            min_clients: 0,
            grace_period: 10,
            poll_interval: 100,
        };
        assert!(ledger.validate().is_err());
        let ledger = LedgerSettings {
            min_clients: 1,
            grace_period: 10,
            poll_interval: 100,
        };
        assert!(ledger.validate().is_ok());
        assert_eq!(ledger.grace_period(), chrono::Duration::seconds(10));
    }
}
