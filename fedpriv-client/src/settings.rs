//! Loading and validation of the client settings.
//!
//! Values defined in the configuration file can be overridden by
//! environment variables. An example configuration file can be found in
//! the `configs/` directory located in the repository root.

use std::{fmt, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::trainer::PrivacyConfig;

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
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub privacy: PrivacySettings,
    #[validate]
    pub training: TrainingSettings,
    #[validate]
    pub data: DataSettings,
    pub metrics: MetricsSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("fedpriv_client").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Coordinator API settings.
pub struct ApiSettings {
    /// The base URL of the coordinator.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// coordinator_url = "http://127.0.0.1:8080"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_API__COORDINATOR_URL=http://127.0.0.1:8080
    /// ```
    pub coordinator_url: String,

    #[serde(default = "default_poll_interval_secs")]
    /// How often the coordinator is polled for new round parameters, in
    /// seconds. Defaults to 1.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// poll_interval_secs = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_API__POLL_INTERVAL_SECS=1
    /// ```
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    1
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_privacy"))]
/// Differential privacy settings.
pub struct PrivacySettings {
    /// The ratio of the noise standard deviation to the clipping norm.
    /// The value must be positive.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// noise_multiplier = 1.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_PRIVACY__NOISE_MULTIPLIER=1.0
    /// ```
    pub noise_multiplier: f64,

    /// The L2 norm each per-example gradient is clipped to. The value
    /// must be positive.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// max_grad_norm = 1.0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_PRIVACY__MAX_GRAD_NORM=1.0
    /// ```
    pub max_grad_norm: f64,

    /// The delta of the `(epsilon, delta)` guarantee. The value must lie
    /// strictly between zero and one.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [privacy]
    /// delta = 1e-5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_PRIVACY__DELTA=1e-5
    /// ```
    pub delta: f64,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            noise_multiplier: 1.0,
            max_grad_norm: 1.0,
            delta: 1e-5,
        }
    }
}

impl From<PrivacySettings> for PrivacyConfig {
    fn from(settings: PrivacySettings) -> Self {
        PrivacyConfig {
            noise_multiplier: settings.noise_multiplier,
            max_grad_norm: settings.max_grad_norm,
            delta: settings.delta,
        }
    }
}

fn validate_privacy(settings: &PrivacySettings) -> Result<(), ValidationError> {
    if !(settings.noise_multiplier > 0.0) {
        return Err(ValidationError::new("noise_multiplier must be positive"));
    }
    if !(settings.max_grad_norm > 0.0) {
        return Err(ValidationError::new("max_grad_norm must be positive"));
    }
    if !(settings.delta > 0.0 && settings.delta < 1.0) {
        return Err(ValidationError::new(
            "delta must lie strictly between zero and one",
        ));
    }
    Ok(())
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_training"))]
/// Local training settings.
pub struct TrainingSettings {
    #[validate(range(min = 1))]
    /// The batch size of the noisy gradient steps. The value must be
    /// greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// batch_size = 32
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_TRAINING__BATCH_SIZE=32
    /// ```
    pub batch_size: usize,

    /// The learning rate of the gradient steps. The value must be
    /// positive.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// learning_rate = 0.01
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_TRAINING__LEARNING_RATE=0.01
    /// ```
    pub learning_rate: f32,

    /// The seed for batch shuffling and noise sampling.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// seed = 0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_TRAINING__SEED=0
    /// ```
    pub seed: u64,

    /// The seed the initial model parameters are derived from. It must
    /// match the coordinator's `init_seed` so that every process starts
    /// from the same parameters.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// init_seed = 42
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_TRAINING__INIT_SEED=42
    /// ```
    pub init_seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            learning_rate: 0.01,
            seed: 0,
            init_seed: 42,
        }
    }
}

fn validate_training(settings: &TrainingSettings) -> Result<(), ValidationError> {
    if !(settings.learning_rate > 0.0) {
        return Err(ValidationError::new("learning_rate must be positive"));
    }
    Ok(())
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_data"))]
/// Local data shard settings.
pub struct DataSettings {
    #[validate(range(min = 2))]
    /// The number of examples to draw for the local shard. The value must
    /// be greater or equal to `2` so that both splits are non-empty.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// samples = 400
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_DATA__SAMPLES=400
    /// ```
    pub samples: usize,

    /// The fraction of the shard held out for evaluation, in `[0, 1]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// test_fraction = 0.2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_DATA__TEST_FRACTION=0.2
    /// ```
    pub test_fraction: f64,

    /// The seed the shard is drawn from. Every client should use its own
    /// seed.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// seed = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_DATA__SEED=1
    /// ```
    pub seed: u64,
}

fn validate_data(settings: &DataSettings) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&settings.test_fraction) {
        return Err(ValidationError::new(
            "test_fraction must lie between zero and one",
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
/// Metrics log settings.
pub struct MetricsSettings {
    #[serde(default = "default_metrics_file")]
    /// Path to the shared metrics file. Defaults to `metrics.json`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [metrics]
    /// file = "metrics.json"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_CLIENT_METRICS__FILE=metrics.json
    /// ```
    pub file: PathBuf,
}

fn default_metrics_file() -> PathBuf {
    PathBuf::from("metrics.json")
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
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
    /// FEDPRIV_CLIENT_LOG__FILTER=info
    /// ```
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
            write!(formatter, "a valid tracing filter directive")
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

    #[test]
    fn test_settings_new() {
        assert!(Settings::new(PathBuf::from("../configs/client.toml")).is_ok());
        assert!(Settings::new(PathBuf::from("")).is_err());
    }

    #[test]
    fn test_validate_privacy() {
        assert!(PrivacySettings::default().validate().is_ok());
        assert!(PrivacySettings {
            noise_multiplier: 0.0,
            ..PrivacySettings::default()
        }
        .validate()
        .is_err());
        assert!(PrivacySettings {
            max_grad_norm: -1.0,
            ..PrivacySettings::default()
        }
        .validate()
        .is_err());
        assert!(PrivacySettings {
            delta: 1.0,
            ..PrivacySettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_training() {
        assert!(TrainingSettings::default().validate().is_ok());
        assert!(TrainingSettings {
            batch_size: 0,
            ..TrainingSettings::default()
        }
        .validate()
        .is_err());
        assert!(TrainingSettings {
            learning_rate: 0.0,
            ..TrainingSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_data() {
        let data = DataSettings {
            samples: 400,
            test_fraction: 0.2,
            seed: 1,
        };
        assert!(data.validate().is_ok());
        assert!(DataSettings {
            samples: 1,
            ..data
        }
        .validate()
        .is_err());
        assert!(DataSettings {
            test_fraction: 1.5,
            ..data
        }
        .validate()
        .is_err());
    }
}
