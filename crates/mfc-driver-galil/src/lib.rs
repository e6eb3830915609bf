//! Galil DMC stage driver for the microfluidic rig.
//!
//! The controller is reached over TCP when configured with an IP address
//! and over a serial port otherwise.

pub mod dmc;

pub use dmc::{GalilController, GalilFactory, MIN_SPEED_MM_S, X_COUNTS_PER_MM, Y_COUNTS_PER_MM};
