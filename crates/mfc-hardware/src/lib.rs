//! `mfc-hardware`
//!
//! Everything between a hardware configuration file and a connected rig:
//!
//! - [`config`]: hardware file loading (TOML/JSON, profiles, `MFC_` overrides)
//! - [`registry`]: family name to [`DriverFactory`](mfc_core::DriverFactory)
//! - [`mock`]: simulated families running the real drivers
//! - [`rig`]: bring-up, polling and shutdown of the three subsystems
//! - [`chip`]: per-chip valve and flow names

pub mod chip;
pub mod config;
pub mod mock;
pub mod registry;
pub mod rig;

pub use chip::{ChipConfig, ChipEntry};
pub use config::{load_hardware, save_hardware, ConfigLoadError, HardwareConfig, Role, SubsystemConfig};
pub use registry::{BuiltDevice, DriverRegistry};
pub use rig::{Rig, SubsystemReport, SubsystemStatus};
