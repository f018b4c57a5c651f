//! Typed environment configuration
//!
//! The environment configuration lives in the settings document keyed by
//! [`ENVIRON_SETTINGS_KEY`](crate::store::ENVIRON_SETTINGS_KEY). The
//! [`EnvironConfigWatcher`](crate::watch::Watch::environ_config) parses each
//! settings revision into this type and only delivers revisions that parse.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::Settings;

#[derive(Debug, Error)]
#[error("invalid environment configuration: {0}")]
/// The settings map does not describe a valid environment configuration
pub struct ConfigError(#[from] serde_json::Error);

/// Parsed environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironConfig {
    /// Environment name
    pub name: String,
    /// Provider type
    #[serde(rename = "type")]
    pub provider: String,
    #[serde(default)]
    pub default_series: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Provider-specific attributes not interpreted by this layer
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EnvironConfig {
    /// Parse a settings document into a configuration
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let cfg: EnvironConfig = serde_json::from_value(Value::Object(settings.map.clone()))?;
        if cfg.name.is_empty() {
            return Err(ConfigError(serde::de::Error::custom("empty name")));
        }
        if cfg.provider.is_empty() {
            return Err(ConfigError(serde::de::Error::custom("empty type")));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> Settings {
        let Value::Object(map) = value else {
            panic!("settings must be a map");
        };
        Settings { version: 1, map }
    }

    #[test]
    fn test_parses_valid_settings() {
        let cfg = EnvironConfig::from_settings(&settings(json!({
            "name": "staging",
            "type": "ec2",
            "region": "eu-west-1",
        })))
        .unwrap();

        assert_eq!(cfg.name, "staging");
        assert_eq!(cfg.provider, "ec2");
        assert_eq!(cfg.extra["region"], json!("eu-west-1"));
    }

    #[test]
    fn test_rejects_missing_type() {
        let res = EnvironConfig::from_settings(&settings(json!({ "name": "staging" })));
        assert!(res.is_err());
    }

    #[test]
    fn test_rejects_empty_name() {
        let res = EnvironConfig::from_settings(&settings(json!({
            "name": "",
            "type": "ec2",
        })));
        assert!(res.is_err());
    }
}
