//! Per-chip metadata (`chipConfig.json`).
//!
//! Valves and flow lines are keyed by channel number (as a string, the way
//! the files are written). Each entry carries a display name and an overlay
//! position that is preserved but never interpreted here.

use anyhow::{Context, Result};
use mfc_core::error::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipEntry {
    pub name: String,
    /// Normalised overlay position, `[0, 1] x [0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
    /// Fields this crate does not know about, written back unchanged
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChipEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChipConfig {
    #[serde(default)]
    pub valves: BTreeMap<String, ChipEntry>,
    #[serde(default)]
    pub flows: BTreeMap<String, ChipEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn unknown_channel(channel: u16, entries: &BTreeMap<String, ChipEntry>) -> RigError {
    RigError::ChannelOutOfRange {
        channel,
        total: u16::try_from(entries.len()).unwrap_or(u16::MAX),
    }
}

impl ChipConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chip config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse chip config: {}", path.display()))
    }

    /// Write back with sorted keys and two-space indentation.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("Failed to serialize chip config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write chip config: {}", path.display()))
    }

    pub fn valve_name(&self, channel: u16) -> Option<&str> {
        self.valves
            .get(&channel.to_string())
            .map(|entry| entry.name.as_str())
    }

    pub fn flow_name(&self, channel: u16) -> Option<&str> {
        self.flows
            .get(&channel.to_string())
            .map(|entry| entry.name.as_str())
    }

    /// Channel of the valve called `name`, compared case-insensitively.
    pub fn valve_by_name(&self, name: &str) -> Option<u16> {
        self.valves
            .iter()
            .find(|(_, entry)| entry.name.eq_ignore_ascii_case(name.trim()))
            .and_then(|(key, _)| key.parse().ok())
    }

    pub fn rename_valve(&mut self, channel: u16, name: impl Into<String>) -> RigResult<()> {
        let missing = unknown_channel(channel, &self.valves);
        let entry = self.valves.get_mut(&channel.to_string()).ok_or(missing)?;
        entry.name = name.into();
        Ok(())
    }

    pub fn rename_flow(&mut self, channel: u16, name: impl Into<String>) -> RigResult<()> {
        let missing = unknown_channel(channel, &self.flows);
        let entry = self.flows.get_mut(&channel.to_string()).ok_or(missing)?;
        entry.name = name.into();
        Ok(())
    }

    /// Valve channels in numeric order.
    pub fn valve_channels(&self) -> Vec<u16> {
        let mut channels: Vec<u16> = self.valves.keys().filter_map(|k| k.parse().ok()).collect();
        channels.sort_unstable();
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "valves": {
            "1": {"name": "Inlet", "position": [0.1, 0.2]},
            "2": {"name": "Outlet", "position": [0.8, 0.2], "color": "red"},
            "10": {"name": "Sieve"}
        },
        "flows": {
            "1": {"name": "Oil"}
        },
        "image": "chip.png"
    }"#;

    #[test]
    fn names_and_lookup() {
        let chip: ChipConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(chip.valve_name(2), Some("Outlet"));
        assert_eq!(chip.valve_by_name("sieve"), Some(10));
        assert_eq!(chip.valve_by_name("missing"), None);
        assert_eq!(chip.flow_name(1), Some("Oil"));
        assert_eq!(chip.valve_channels(), vec![1, 2, 10]);
    }

    #[test]
    fn renaming_unknown_channel_fails() {
        let mut chip: ChipConfig = serde_json::from_str(SAMPLE).unwrap();
        assert!(matches!(
            chip.rename_valve(7, "Nope"),
            Err(RigError::ChannelOutOfRange { channel: 7, .. })
        ));
        chip.rename_flow(1, "Water").unwrap();
        assert_eq!(chip.flow_name(1), Some("Water"));
    }
}
