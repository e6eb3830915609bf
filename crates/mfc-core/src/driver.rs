//! Driver factory and family selection.
//!
//! A hardware family name from configuration resolves to a [`DriverFamily`];
//! the registry in `mfc-hardware` maps each family to a [`DriverFactory`]
//! that turns the positional argument vector into a constructed (but not yet
//! connected) driver.
//!
//! # Example
//!
//! ```rust,ignore
//! use mfc_core::driver::{DriverFactory, DriverFamily, DeviceComponents, Capability};
//!
//! struct MyValveFactory;
//!
//! impl DriverFactory for MyValveFactory {
//!     fn family(&self) -> DriverFamily { DriverFamily::Wago }
//!     fn name(&self) -> &'static str { "WAGO 750 Valve Bank" }
//!     fn capabilities(&self) -> &'static [Capability] { &[Capability::Valves] }
//!
//!     fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
//!         ArgList::new(self.family(), args).string(0, "ip").map(|_| ())
//!     }
//!
//!     fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
//!         Box::pin(async move { /* construct driver */ })
//!     }
//! }
//! ```

use crate::capabilities::{Driver, PressureControl, StageControl, ValveControl};
use crate::error::{RigError, RigResult};
use crate::poller::PollerConfig;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Driver Family
// =============================================================================

/// Hardware families known to the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverFamily {
    /// WAGO 750 fieldbus valve bank (Modbus TCP)
    #[serde(rename = "wago")]
    Wago,
    /// Fluigent MFCS-EZ pressure controllers (vendor C ABI)
    #[serde(rename = "mfcs-ez")]
    MfcsEz,
    /// ASI MS-2000 XY stage (serial)
    #[serde(rename = "asi")]
    Asi,
    /// Galil DMC motion controller (TCP or serial)
    #[serde(rename = "galil", alias = "gallil")]
    Galil,
    /// Simulated valve bank
    #[serde(rename = "mock_valve")]
    MockValve,
    /// Simulated pressure controller
    #[serde(rename = "mock_flow")]
    MockFlow,
    /// Simulated ASI stage
    #[serde(rename = "mock_stage")]
    MockStage,
    /// Simulated Galil controller
    #[serde(rename = "mock_galil")]
    MockGalil,
}

impl DriverFamily {
    pub const ALL: [DriverFamily; 8] = [
        Self::Wago,
        Self::MfcsEz,
        Self::Asi,
        Self::Galil,
        Self::MockValve,
        Self::MockFlow,
        Self::MockStage,
        Self::MockGalil,
    ];

    /// Identifier used in hardware configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wago => "wago",
            Self::MfcsEz => "mfcs-ez",
            Self::Asi => "asi",
            Self::Galil => "galil",
            Self::MockValve => "mock_valve",
            Self::MockFlow => "mock_flow",
            Self::MockStage => "mock_stage",
            Self::MockGalil => "mock_galil",
        }
    }

    pub fn is_simulated(self) -> bool {
        matches!(
            self,
            Self::MockValve | Self::MockFlow | Self::MockStage | Self::MockGalil
        )
    }
}

impl fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverFamily {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        if key == "gallil" {
            return Ok(Self::Galil);
        }
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == key)
            .ok_or_else(|| RigError::UnknownDriver(s.to_string()))
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capability views a driver can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`ValveControl`]
    Valves,
    /// Corresponds to [`PressureControl`]
    Pressure,
    /// Corresponds to [`StageControl`]
    Stage,
}

/// Everything a factory produces for one configured device.
///
/// `driver` is always present; the capability fields are views onto the same
/// object for the operations that family supports.
#[derive(Clone)]
pub struct DeviceComponents {
    pub driver: Arc<dyn Driver>,
    pub valves: Option<Arc<dyn ValveControl>>,
    pub pressure: Option<Arc<dyn PressureControl>>,
    pub stage: Option<Arc<dyn StageControl>>,
}

impl DeviceComponents {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            valves: None,
            pressure: None,
            stage: None,
        }
    }

    pub fn with_valves(mut self, valves: Arc<dyn ValveControl>) -> Self {
        self.valves = Some(valves);
        self
    }

    pub fn with_pressure(mut self, pressure: Arc<dyn PressureControl>) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn with_stage(mut self, stage: Arc<dyn StageControl>) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.valves.is_some() {
            caps.push(Capability::Valves);
        }
        if self.pressure.is_some() {
            caps.push(Capability::Pressure);
        }
        if self.stage.is_some() {
            caps.push(Capability::Stage);
        }
        caps
    }
}

impl fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("family", &self.driver.family())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Constructs drivers of one family from positional configuration arguments.
pub trait DriverFactory: Send + Sync + 'static {
    /// Family this factory is registered under.
    fn family(&self) -> DriverFamily;

    /// Human-readable name for logs and `mfc status`.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Check the argument vector without constructing anything.
    ///
    /// Runs at startup so a bad configuration fails before first use.
    fn validate(&self, args: &[toml::Value]) -> RigResult<()>;

    /// Construct the driver. The returned driver is not connected yet.
    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>>;

    /// Polling cadence for this family.
    fn default_poll(&self) -> PollerConfig {
        PollerConfig::default()
    }
}

// =============================================================================
// Positional arguments
// =============================================================================

/// Typed access to a configuration argument vector.
///
/// Numbers may be written either as integers or as strings, since hand-edited
/// hardware files mix both.
#[derive(Debug, Clone, Copy)]
pub struct ArgList<'a> {
    family: DriverFamily,
    args: &'a [toml::Value],
}

impl<'a> ArgList<'a> {
    pub fn new(family: DriverFamily, args: &'a [toml::Value]) -> Self {
        Self { family, args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn missing(&self, index: usize, name: &str) -> RigError {
        RigError::invalid_arguments(
            self.family,
            format!("missing argument {index} ({name})"),
        )
    }

    pub fn string(&self, index: usize, name: &str) -> RigResult<String> {
        match self.args.get(index) {
            Some(toml::Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Some(toml::Value::Integer(i)) => Ok(i.to_string()),
            Some(other) => Err(RigError::invalid_arguments(
                self.family,
                format!("argument {index} ({name}) must be a string, got {other}"),
            )),
            None => Err(self.missing(index, name)),
        }
    }

    pub fn integer(&self, index: usize, name: &str) -> RigResult<u32> {
        let value = self.args.get(index).ok_or_else(|| self.missing(index, name))?;
        let parsed = match value {
            toml::Value::Integer(i) => u32::try_from(*i).ok(),
            toml::Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            RigError::invalid_arguments(
                self.family,
                format!("argument {index} ({name}) must be a non-negative integer, got {value}"),
            )
        })
    }

    pub fn optional_integer(&self, index: usize, name: &str) -> RigResult<Option<u32>> {
        if index >= self.args.len() {
            return Ok(None);
        }
        self.integer(index, name).map(Some)
    }

    /// Every argument from `start` onward as a string.
    pub fn strings_from(&self, start: usize, name: &str) -> RigResult<Vec<String>> {
        (start..self.args.len())
            .map(|i| self.string(i, name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_names_round_trip() {
        for family in DriverFamily::ALL {
            assert_eq!(family.as_str().parse::<DriverFamily>(), Ok(family));
        }
    }

    #[test]
    fn gallil_spelling_is_accepted() {
        assert_eq!("Gallil".parse::<DriverFamily>(), Ok(DriverFamily::Galil));
    }

    #[test]
    fn unknown_family_fails() {
        assert_eq!(
            "labjack".parse::<DriverFamily>(),
            Err(RigError::UnknownDriver("labjack".into()))
        );
    }

    #[test]
    fn arg_list_accepts_numeric_strings() {
        let args = vec![
            toml::Value::String("192.168.1.2".into()),
            toml::Value::String("8".into()),
            toml::Value::Integer(512),
        ];
        let list = ArgList::new(DriverFamily::Wago, &args);
        assert_eq!(list.string(0, "ip").unwrap(), "192.168.1.2");
        assert_eq!(list.integer(1, "valve_num").unwrap(), 8);
        assert_eq!(list.integer(2, "reg_addr").unwrap(), 512);
        assert_eq!(list.optional_integer(3, "write_base").unwrap(), None);
    }

    #[test]
    fn arg_list_reports_missing_and_malformed() {
        let args = vec![toml::Value::Integer(-1)];
        let list = ArgList::new(DriverFamily::Wago, &args);
        assert!(matches!(
            list.integer(0, "valve_num"),
            Err(RigError::InvalidArguments { .. })
        ));
        let err = list.string(1, "reg_addr").unwrap_err();
        assert!(err.to_string().contains("missing argument 1"));
    }
}
