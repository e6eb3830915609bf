//! Error types for the rig control layer.
//!
//! Every driver operation returns [`RigResult`], so callers decide whether a
//! failure disables a subsystem, gets retried, or propagates. Using the
//! `thiserror` crate keeps the taxonomy in one place:
//!
//! - **`Connection`**: the transport could not be opened. Non-fatal for the
//!   process; the owning subsystem is presented as disabled.
//! - **`Command`**: a write/read round trip failed mid-session.
//! - **`BusyTimeout`**: a device kept reporting "busy" past the configured bound.
//! - **`UnknownUnit`** / **`IncompatibleUnit`**: unit lookups that cannot be honoured.
//! - **`UnknownDriver`**: a configured hardware family has no registered factory.
//! - **`PartialWrite`**: an all-channel write where some channels failed.

use crate::driver::DriverFamily;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Primary error type for hardware control.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RigError {
    /// Transport could not be opened, or the device refused initialisation.
    ///
    /// **Error Type**: Permanent for this session - check cabling, address or power.
    #[error("{family} connection failed: {message}")]
    Connection {
        family: DriverFamily,
        message: String,
    },

    /// A command round trip failed after the device was connected.
    ///
    /// **Error Type**: Possibly transient - re-read state and retry if appropriate.
    #[error("{family} command failed: {message}")]
    Command {
        family: DriverFamily,
        message: String,
    },

    /// The device stayed busy for longer than the busy-wait bound.
    #[error("{family} still busy after {}ms", waited.as_millis())]
    BusyTimeout {
        family: DriverFamily,
        waited: Duration,
    },

    /// Unit name not present in the conversion table.
    #[error("Unknown unit '{0}' (available: mba, kpa, psi)")]
    UnknownUnit(String),

    /// Unit exists but measures a different quantity than the driver controls.
    #[error("Unit {unit} cannot be used with a {family} driver")]
    IncompatibleUnit { family: DriverFamily, unit: String },

    /// Hardware family name has no registered driver.
    #[error("Unknown driver family '{0}'")]
    UnknownDriver(String),

    /// Some channels of an all-channel write failed.
    ///
    /// The remaining channels were written; re-read to learn the true state.
    #[error("{family} write failed on channel(s) {failed:?}")]
    PartialWrite {
        family: DriverFamily,
        failed: Vec<u16>,
    },

    /// Channel number outside `1..=total`.
    #[error("Channel {channel} out of range (1..={total})")]
    ChannelOutOfRange { channel: u16, total: u16 },

    /// Setpoint outside the safety limits of the current unit.
    #[error("Setpoint {value} {unit} outside 0..={limit}")]
    OutOfRange { value: f64, limit: f64, unit: String },

    /// Operation needs an open transport.
    #[error("{0} is not connected")]
    NotConnected(DriverFamily),

    /// `connect()` was called on an already connected driver.
    #[error("{0} is already connected")]
    AlreadyConnected(DriverFamily),

    /// Setpoint kind not understood by this driver family.
    #[error("{family} cannot apply {setpoint}")]
    UnsupportedSetpoint {
        family: DriverFamily,
        setpoint: String,
    },

    /// Constructor arguments from configuration were missing or malformed.
    #[error("Invalid arguments for {family}: {message}")]
    InvalidArguments {
        family: DriverFamily,
        message: String,
    },
}

impl RigError {
    pub fn connection(family: DriverFamily, message: impl Into<String>) -> Self {
        Self::Connection {
            family,
            message: message.into(),
        }
    }

    pub fn command(family: DriverFamily, message: impl Into<String>) -> Self {
        Self::Command {
            family,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(family: DriverFamily, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            family,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_timeout_message_reports_millis() {
        let err = RigError::BusyTimeout {
            family: DriverFamily::Asi,
            waited: Duration::from_millis(2100),
        };
        assert_eq!(err.to_string(), "asi still busy after 2100ms");
    }
}
