//! Loading and validation of settings.
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
use validator::{Validate, ValidationErrors};

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
    pub protocol: ProtocolSettings,
    pub model: ModelSettings,
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
            .add_source(Environment::with_prefix("fedpriv").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "127.0.0.1:8080"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_API__BIND_ADDRESS=127.0.0.1:8080
    /// ```
    pub bind_address: std::net::SocketAddr,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Federated averaging protocol settings.
pub struct ProtocolSettings {
    #[validate(range(min = 1))]
    /// The number of federated averaging rounds to run. The value must be
    /// greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// rounds = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_PROTOCOL__ROUNDS=3
    /// ```
    pub rounds: u64,

    #[validate(range(min = 1))]
    /// The number of clients the coordinator waits for in every round
    /// before it aggregates. The value must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// expected_clients = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_PROTOCOL__EXPECTED_CLIENTS=2
    /// ```
    pub expected_clients: usize,

    #[serde(default = "default_warmup_secs")]
    /// How long to wait before the first round starts, in seconds, so
    /// that clients have a chance to connect. Defaults to 5.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// warmup_secs = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_PROTOCOL__WARMUP_SECS=5
    /// ```
    pub warmup_secs: u64,

    #[serde(default)]
    /// An optional limit on how long the coordinator waits for client
    /// responses in a single collection step, in seconds. When the limit
    /// expires the round fails instead of stalling forever on a hung
    /// client. Unset by default.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// round_timeout_secs = 300
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_PROTOCOL__ROUND_TIMEOUT_SECS=300
    /// ```
    pub round_timeout_secs: Option<u64>,
}

fn default_warmup_secs() -> u64 {
    5
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            rounds: 3,
            expected_clients: 1,
            warmup_secs: default_warmup_secs(),
            round_timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Global model settings.
pub struct ModelSettings {
    /// The seed used to initialize the global model before the first
    /// round. Clients that use the same seed start from the same
    /// parameters.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// init_seed = 42
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDPRIV_MODEL__INIT_SEED=42
    /// ```
    pub init_seed: u64,
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
    /// FEDPRIV_LOG__FILTER=info
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
        assert!(Settings::new(PathBuf::from("../configs/coordinator.toml")).is_ok());
        assert!(Settings::new(PathBuf::from("")).is_err());
    }

    #[test]
    fn test_validate_protocol() {
        assert!(ProtocolSettings::default().validate().is_ok());
        assert!(ProtocolSettings {
            rounds: 0,
            ..ProtocolSettings::default()
        }
        .validate()
        .is_err());
        assert!(ProtocolSettings {
            expected_clients: 0,
            ..ProtocolSettings::default()
        }
        .validate()
        .is_err());
    }
}
