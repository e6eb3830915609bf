//! # Microfluidic Control
//!
//! Hardware control layer for a microfluidic rig: a valve bank, pressure
//! controllers and an XY stage behind one driver contract.
//!
//! The work lives in the member crates; this crate re-exports them so the
//! `mfc` binary and downstream tools have a single dependency.
//!
//! - [`mfc_core`]: driver contract, units, channel addressing, poller
//! - [`mfc_hardware`]: configuration, driver registry, rig bring-up

pub use mfc_core;
pub use mfc_hardware;

pub use mfc_core::{
    ChannelTarget, DeviceState, Driver, DriverFamily, PressureControl, PressureUnit, RigError,
    RigResult, Snapshot, StageControl, Unit, ValveControl,
};
pub use mfc_hardware::{
    load_hardware, ChipConfig, DriverRegistry, HardwareConfig, Rig, Role, SubsystemReport,
    SubsystemStatus,
};
