//! Unit conversion table.
//!
//! Pressure is stored and sent to hardware in millibar. Display units are a
//! single multiplicative factor away: `display = canonical * factor`.

use crate::driver::DriverFamily;
use crate::error::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Millibar to pounds per square inch.
pub const MBAR_TO_PSI: f64 = 0.0145037738007;
/// Millibar to kilopascal.
pub const MBAR_TO_KPA: f64 = 0.1;

/// Pressure display units understood by the pressure controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureUnit {
    /// Canonical unit ("mba")
    Millibar,
    /// "kpa"
    Kilopascal,
    /// "psi"
    Psi,
}

impl PressureUnit {
    pub const CANONICAL: PressureUnit = PressureUnit::Millibar;
    pub const ALL: [PressureUnit; 3] = [Self::Millibar, Self::Kilopascal, Self::Psi];

    /// Factor applied to a canonical (millibar) value to express it in `self`.
    pub fn factor(self) -> f64 {
        match self {
            Self::Millibar => 1.0,
            Self::Kilopascal => MBAR_TO_KPA,
            Self::Psi => MBAR_TO_PSI,
        }
    }

    /// Maximum allowed setpoint expressed in `self`.
    pub fn limit(self) -> f64 {
        match self {
            Self::Millibar => 1034.0,
            Self::Kilopascal => 103.4,
            Self::Psi => 15.0,
        }
    }

    /// Short name as used in configuration files.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Millibar => "mba",
            Self::Kilopascal => "kpa",
            Self::Psi => "psi",
        }
    }

    /// Canonical millibar to this unit.
    pub fn to_display(self, millibar: f64) -> f64 {
        millibar * self.factor()
    }

    /// This unit to canonical millibar.
    pub fn to_canonical(self, value: f64) -> f64 {
        value / self.factor()
    }

    /// Reject setpoints outside `0..=limit` of this unit.
    pub fn check_setpoint(self, value: f64) -> RigResult<()> {
        let limit = self.limit();
        if !(0.0..=limit).contains(&value) || value.is_nan() {
            return Err(RigError::OutOfRange {
                value,
                limit,
                unit: self.symbol().to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for PressureUnit {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mba" | "mbar" => Ok(Self::Millibar),
            "kpa" => Ok(Self::Kilopascal),
            "psi" => Ok(Self::Psi),
            _ => Err(RigError::UnknownUnit(s.to_string())),
        }
    }
}

/// Convert a value between two pressure units, pivoting through millibar.
pub fn convert(value: f64, from: PressureUnit, to: PressureUnit) -> f64 {
    to.to_display(from.to_canonical(value))
}

/// Display unit carried by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Pressure(PressureUnit),
    /// Stage positions; converted to device counts inside the driver.
    Millimeter,
    /// Valve state has no scale.
    OpenClosed,
}

impl Unit {
    /// Canonical to display factor.
    pub fn factor(self) -> f64 {
        match self {
            Self::Pressure(p) => p.factor(),
            Self::Millimeter | Self::OpenClosed => 1.0,
        }
    }

    /// Safety limit, when the quantity has one.
    pub fn limit(self) -> Option<f64> {
        match self {
            Self::Pressure(p) => Some(p.limit()),
            Self::Millimeter | Self::OpenClosed => None,
        }
    }

    pub fn same_quantity(self, other: Unit) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }

    /// Error for a unit that does not fit `family`.
    pub fn incompatible(self, family: DriverFamily) -> RigError {
        RigError::IncompatibleUnit {
            family,
            unit: self.to_string(),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pressure(p) => p.fmt(f),
            Self::Millimeter => f.write_str("mm"),
            Self::OpenClosed => f.write_str("open/closed"),
        }
    }
}

impl FromStr for Unit {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mm" => Ok(Self::Millimeter),
            "open/closed" | "bool" => Ok(Self::OpenClosed),
            _ => s.parse::<PressureUnit>().map(Self::Pressure),
        }
    }
}
