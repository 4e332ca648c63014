//! Runtime configuration.
//!
//! Every field has a default, so a host may ship a partial TOML file or none at all.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    migration::{SchemaVersion, CURRENT_SCHEMA_VERSION},
    rotation::{BackgroundType, RotationPolicy},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Invalid or unparsable runtime configuration.
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("failed to parse runtime config: {0}")]
    Parse(String),
    /// A field holds a value outside its allowed range.
    #[error("invalid runtime config field `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Tunables for one settings runtime.
pub struct RuntimeConfig {
    /// Schema version this build migrates persisted data up to.
    pub expected_schema_version: SchemaVersion,
    /// Seconds between quota checks.
    pub quota_check_period_secs: u64,
    /// Used/quota ratio at which a warning is raised.
    pub quota_high_water_ratio: f64,
    /// Rotation interval used before the user picks one.
    pub default_rotation_interval_secs: u32,
    /// Smallest rotation interval accepted.
    pub min_rotation_interval_secs: u32,
    /// Turn rotation on automatically once two entries exist.
    pub auto_enable_rotation: bool,
    /// Static background shown when the entry list empties.
    pub fallback_background_type: BackgroundType,
    /// Step to the next background whenever a view opens with rotation enabled. Popup views
    /// turn this off.
    pub advance_on_open: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            expected_schema_version: CURRENT_SCHEMA_VERSION,
            quota_check_period_secs: 60,
            quota_high_water_ratio: 0.9,
            default_rotation_interval_secs: 30,
            min_rotation_interval_secs: 5,
            auto_enable_rotation: true,
            fallback_background_type: BackgroundType::Gradient,
            advance_on_open: true,
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`] for
    /// out-of-range values.
    pub fn from_toml_str(body: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(body).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota_check_period_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "quota_check_period_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.quota_high_water_ratio > 0.0 && self.quota_high_water_ratio <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "quota_high_water_ratio",
                reason: format!("{} is outside (0, 1]", self.quota_high_water_ratio),
            });
        }
        if self.min_rotation_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "min_rotation_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.default_rotation_interval_secs < self.min_rotation_interval_secs {
            return Err(ConfigError::Invalid {
                field: "default_rotation_interval_secs",
                reason: format!(
                    "{} is below the minimum of {}",
                    self.default_rotation_interval_secs, self.min_rotation_interval_secs
                ),
            });
        }
        if self.fallback_background_type.rotates() {
            return Err(ConfigError::Invalid {
                field: "fallback_background_type",
                reason: "must be a static type (color, gradient, random)".to_string(),
            });
        }
        Ok(())
    }

    /// Quota check period.
    pub fn quota_check_period(&self) -> Duration {
        Duration::from_secs(self.quota_check_period_secs)
    }

    /// Rotation policy derived from this config.
    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            default_interval_secs: self.default_rotation_interval_secs,
            min_interval_secs: self.min_rotation_interval_secs,
            auto_enable: self.auto_enable_rotation,
            fallback_type: self.fallback_background_type,
            advance_on_open: self.advance_on_open,
        }
    }
}
