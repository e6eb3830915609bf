//! Simulated transports and devices for the rig drivers.
//!
//! Each simulated device keeps its state behind an `Arc`, so a test can hold
//! one handle to inspect or perturb the device while the driver under test
//! talks to it through a connector.
//!
//! - [`serial`]: mock serial port, scripted harness, and line-device connector
//! - [`asi`]: ASI MS-2000 XY stage
//! - [`galil`]: Galil DMC motion controller
//! - [`coils`]: Modbus coil bank

pub mod asi;
pub mod coils;
pub mod galil;
pub mod serial;

pub use asi::SimulatedAsiStage;
pub use coils::{SimulatedCoilBank, SimulatedCoilConnector};
pub use galil::SimulatedGalil;
pub use serial::{LineDevice, MockDeviceHarness, MockSerialPort, SimulatedConnector};
