//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables
//! prefixed with `CROWD`, using `__` as the section separator. An example configuration
//! file lives in `configs/config.toml`.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::records::DeviceId;

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
    pub device: DeviceSettings,
    #[serde(default)]
    pub session: SessionSettings,
    pub log: LoggingSettings,
    #[serde(default)]
    #[validate]
    pub simulation: SimulationSettings,
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
            .add_source(
                Environment::with_prefix("crowd")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// The settings the synchronization engine of this device runs with.
    pub fn engine(&self) -> EngineSettings {
        EngineSettings {
            device: DeviceId::new(self.device.id.clone()),
            reconnect: self.session.reconnect,
        }
    }
}

/// The device settings.
#[derive(Debug, Validate, Deserialize, Clone)]
pub struct DeviceSettings {
    /// The identity under which the device's coordination record is stored.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [device]
    /// id = "phone-7"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CROWD_DEVICE__ID=phone-7
    /// ```
    #[validate(length(min = 1))]
    pub id: String,
}

/// What the re-subscription following a Wi-Fi disconnect does with the per-device
/// counters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Keep the gradient iteration and the initialized flag.
    Preserve,
    /// Start over as on a fresh launch.
    Reset,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Preserve
    }
}

/// The session settings.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct SessionSettings {
    /// The reconnect policy.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [session]
    /// reconnect = "reset"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CROWD_SESSION__RECONNECT=reset
    /// ```
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// The settings a [`SyncEngine`] is created with.
///
/// [`SyncEngine`]: crate::SyncEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub device: DeviceId,
    pub reconnect: ReconnectPolicy,
}

impl EngineSettings {
    pub fn new(device: impl Into<DeviceId>) -> Self {
        Self {
            device: device.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
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
    /// CROWD_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

/// The settings of the `crowd-simulate` binary.
#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_simulation"))]
#[serde(default)]
pub struct SimulationSettings {
    /// Number of simulated devices.
    #[validate(range(min = 1))]
    pub devices: usize,
    /// Number of global rounds after which the simulation stops.
    #[validate(range(min = 1))]
    pub rounds: u64,
    /// Number of synthetic samples held by each device.
    #[validate(range(min = 1))]
    pub samples_per_device: usize,
    /// Number of input features.
    #[validate(range(min = 1))]
    pub features: usize,
    /// Number of classes.
    #[validate(range(min = 2))]
    pub classes: usize,
    /// Local steps per work unit. `0` selects the gradient protocol.
    pub local_update_count: u32,
    /// Step size used by devices and by the aggregator.
    pub learning_rate: f64,
    /// Scale of the Laplace noise added to gradients.
    pub noise_scale: f64,
    /// Mini-batch size.
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// Interval at which the aggregator processes submissions, in milliseconds.
    #[validate(range(min = 1))]
    pub tick_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            devices: 3,
            rounds: 50,
            samples_per_device: 200,
            features: 4,
            classes: 3,
            local_update_count: 0,
            learning_rate: 0.1,
            noise_scale: 0.0,
            batch_size: 10,
            tick_ms: 20,
        }
    }
}

impl SimulationSettings {
    /// Checks the step size and the noise scale.
    fn validate_simulation(&self) -> Result<(), ValidationError> {
        // the validate attribute does not handle floats well, therefore we check them here
        if self.learning_rate > 0.0 && self.noise_scale >= 0.0 {
            Ok(())
        } else {
            Err(ValidationError::new("invalid step size or noise scale"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_simulation(s: &SimulationSettings) -> Result<(), ValidationError> {
    s.validate_simulation()
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
