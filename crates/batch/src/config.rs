//! Batching thresholds.
//!
//! Parsed from the `[batch]` table of a TOML file, with environment variable
//! overrides applied on top:
//!
//! ```toml
//! [batch]
//! batch_interval_ms = 10
//! batch_max = 0
//! ```

use std::path::Path;
use std::time::Duration;

use relink_core::config::env_parse;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default time a non-full batch waits before it is flushed.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound accepted for `batch_interval`; anything larger is almost
/// certainly seconds written as milliseconds.
const MAX_BATCH_INTERVAL: Duration = Duration::from_secs(3600);

pub const ENV_BATCH_INTERVAL_MS: &str = "RELINK_BATCH_INTERVAL_MS";
pub const ENV_BATCH_MAX: &str = "RELINK_BATCH_MAX";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum wait between the first request of a batch and its flush.
    #[serde(rename = "batch_interval_ms", with = "duration_ms")]
    pub batch_interval: Duration,

    /// Size at which a batch flushes immediately. 0 = unbounded.
    pub batch_max: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_interval: DEFAULT_BATCH_INTERVAL,
            batch_max: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    batch: BatchConfig,
}

impl BatchConfig {
    pub fn new(batch_interval: Duration, batch_max: usize) -> Self {
        Self {
            batch_interval,
            batch_max,
        }
    }

    pub fn with_interval(mut self, batch_interval: Duration) -> Self {
        self.batch_interval = batch_interval;
        self
    }

    pub fn with_max(mut self, batch_max: usize) -> Self {
        self.batch_max = batch_max;
        self
    }

    /// Parse the `[batch]` table from a TOML string. A missing table yields
    /// the defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        file.batch.validate()?;
        Ok(file.batch)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// File (when given) or defaults, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// - `RELINK_BATCH_INTERVAL_MS` -> `batch_interval`
    /// - `RELINK_BATCH_MAX` -> `batch_max`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse::<u64>(ENV_BATCH_INTERVAL_MS) {
            self.batch_interval = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse::<usize>(ENV_BATCH_MAX) {
            self.batch_max = max;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval > MAX_BATCH_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "batch_interval of {:?} exceeds the {:?} limit",
                self.batch_interval, MAX_BATCH_INTERVAL
            )));
        }
        Ok(())
    }

    /// Whether the size trigger is active.
    pub fn is_bounded(&self) -> bool {
        self.batch_max > 0
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
