//! `mfc-core`
//!
//! Core types and traits for the microfluidic rig control layer.
//!
//! Each hardware family (valve bank, pressure controller, XY stage) wraps its
//! own transport and wire protocol behind the [`Driver`] contract. A
//! [`Poller`] keeps each driver's published [`Snapshot`] fresh while
//! foreground commands share the same transport lock.
//!
//! ## Key Types
//!
//! - [`RigError`]: error taxonomy shared by every driver
//! - [`PressureUnit`] / [`Unit`]: display units and safety limits
//! - [`ChannelMap`]: global channel number to (handle, local channel)
//! - [`DriverFactory`]: builds drivers from configuration arguments
//! - [`BusyPolicy`]: bounded busy-wait for serial and motion controllers

pub mod busy;
pub mod capabilities;
pub mod channel;
pub mod driver;
pub mod error;
pub mod poller;
pub mod smoothing;
pub mod snapshot;
pub mod transport;
pub mod units;

pub use busy::BusyPolicy;
pub use capabilities::{Driver, PressureControl, Setpoint, StageControl, ValveControl, ValveReadback};
pub use channel::{ChannelAddress, ChannelMap, ChannelTarget};
pub use driver::{ArgList, Capability, DeviceComponents, DriverFactory, DriverFamily};
pub use error::{RigError, RigResult};
pub use poller::{Poller, PollerConfig, PollerHandle, PollerStats};
pub use smoothing::MovingAverage;
pub use snapshot::{DeviceState, Position, Snapshot, SnapshotCell};
pub use units::{PressureUnit, Unit};
