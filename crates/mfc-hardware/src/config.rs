//! Hardware configuration loading.
//!
//! A hardware file names the driver family and positional arguments for each
//! subsystem:
//!
//! ```toml
//! [valving]
//! hardware = "wago"
//! config = ["192.168.1.3", 24, 512]
//!
//! [flowing]
//! hardware = "mfcs-ez"
//! config = ["1001", "1002"]
//!
//! [collecting]
//! hardware = "asi"
//! config = "COM4"
//! poll_interval_ms = 250
//! ```
//!
//! A file may instead hold several named setups under `[profiles.<name>]`
//! with a top-level `profile = "<name>"` picking one. JSON files with the
//! same shape are accepted.
//!
//! Environment variables prefixed `MFC_` override file values, with `__`
//! separating nested keys: `MFC_VALVING__HARDWARE=mock_valve`,
//! `MFC_PROFILE=bench`.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Json, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Unsupported config format '{0}' (expected .toml or .json)")]
    UnsupportedFormat(String),

    #[error("Profile '{name}' not found (available: {available})")]
    UnknownProfile { name: String, available: String },

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

// =============================================================================
// Schema
// =============================================================================

/// The three subsystems of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Valving,
    Flowing,
    Collecting,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Valving, Role::Flowing, Role::Collecting];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valving => "valving",
            Self::Flowing => "flowing",
            Self::Collecting => "collecting",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One subsystem's driver selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemConfig {
    /// Driver family name, e.g. `"wago"`
    pub hardware: String,
    /// Positional driver arguments; a single value stands for a one-item list
    #[serde(default, deserialize_with = "one_or_many")]
    pub config: Vec<toml::Value>,
    /// Override of the family's polling interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl SubsystemConfig {
    pub fn new(hardware: impl Into<String>, config: Vec<toml::Value>) -> Self {
        Self {
            hardware: hardware.into(),
            config,
            poll_interval_ms: None,
        }
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<toml::Value>),
    One(toml::Value),
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<toml::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(value) => vec![value],
    })
}

/// Driver selection for every subsystem. Missing subsystems are not
/// configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valving: Option<SubsystemConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flowing: Option<SubsystemConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collecting: Option<SubsystemConfig>,
}

impl HardwareConfig {
    pub fn subsystem(&self, role: Role) -> Option<&SubsystemConfig> {
        match role {
            Role::Valving => self.valving.as_ref(),
            Role::Flowing => self.flowing.as_ref(),
            Role::Collecting => self.collecting.as_ref(),
        }
    }

    pub fn with_subsystem(mut self, role: Role, config: SubsystemConfig) -> Self {
        let slot = match role {
            Role::Valving => &mut self.valving,
            Role::Flowing => &mut self.flowing,
            Role::Collecting => &mut self.collecting,
        };
        *slot = Some(config);
        self
    }

    /// Every subsystem on a simulated family.
    pub fn simulated() -> Self {
        Self::default()
            .with_subsystem(Role::Valving, SubsystemConfig::new("mock_valve", vec![]))
            .with_subsystem(Role::Flowing, SubsystemConfig::new("mock_flow", vec![]))
            .with_subsystem(Role::Collecting, SubsystemConfig::new("mock_stage", vec![]))
    }
}

#[derive(Debug, Deserialize)]
struct HardwareFile {
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    profiles: BTreeMap<String, HardwareConfig>,
    #[serde(flatten)]
    direct: HardwareConfig,
}

// =============================================================================
// Loading
// =============================================================================

fn file_provider(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(ConfigLoadError::UnsupportedFormat(path.display().to_string()).into()),
    }
}

/// Load the hardware configuration from `path`, then apply `MFC_`
/// environment overrides.
///
/// `profile` takes precedence over the file's own `profile` key.
pub fn load_hardware(path: &Path, profile: Option<&str>) -> Result<HardwareConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }
    debug!("Loading hardware config from: {}", path.display());

    let figment = file_provider(path)?.merge(Env::prefixed("MFC_").split("__"));
    let file: HardwareFile = figment
        .extract()
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    let selected = profile.map(str::to_string).or(file.profile);
    let config = match selected {
        Some(name) => file.profiles.get(&name).cloned().ok_or_else(|| {
            ConfigLoadError::UnknownProfile {
                available: file
                    .profiles
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
                name: name.clone(),
            }
        })?,
        None => file.direct,
    };

    info!(
        valving = config.valving.as_ref().map(|s| s.hardware.as_str()),
        flowing = config.flowing.as_ref().map(|s| s.hardware.as_str()),
        collecting = config.collecting.as_ref().map(|s| s.hardware.as_str()),
        "Loaded hardware config"
    );
    Ok(config)
}

/// Write `config` as TOML or JSON, chosen by the extension of `path`.
pub fn save_hardware(path: &Path, config: &HardwareConfig) -> Result<()> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let text = match extension.to_ascii_lowercase().as_str() {
        "toml" => toml::to_string_pretty(config).context("Failed to serialize config")?,
        "json" => serde_json::to_string_pretty(config).context("Failed to serialize config")?,
        _ => return Err(ConfigLoadError::UnsupportedFormat(path.display().to_string()).into()),
    };
    std::fs::write(path, text)
        .map_err(|e| ConfigLoadError::WriteError(format!("{}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_config_becomes_a_list() {
        let parsed: SubsystemConfig =
            toml::from_str("hardware = \"asi\"\nconfig = \"COM4\"").unwrap();
        assert_eq!(parsed.config, vec![toml::Value::String("COM4".into())]);

        let parsed: SubsystemConfig = toml::from_str("hardware = \"mock_stage\"").unwrap();
        assert!(parsed.config.is_empty());
    }

    #[test]
    fn simulated_config_covers_every_role() {
        let config = HardwareConfig::simulated();
        for role in Role::ALL {
            assert!(config.subsystem(role).is_some(), "{role} missing");
        }
    }
}
