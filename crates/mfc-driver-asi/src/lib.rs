//! ASI stage driver for the microfluidic rig.
//!
//! Register the factory with the rig's driver registry:
//!
//! ```rust,ignore
//! use mfc_driver_asi::AsiFactory;
//!
//! registry.register_factory(Box::new(AsiFactory));
//! ```

pub mod ms2000;

pub use ms2000::{AsiFactory, AsiStage, COUNTS_PER_MM, MAX_SPEED_MM_S};
