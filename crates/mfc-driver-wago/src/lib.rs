//! WAGO valve bank driver for the microfluidic rig.
//!
//! Each valve is one Modbus coil on a WAGO 750 fieldbus coupler.

pub mod coupler;
pub mod modbus;

pub use coupler::{WagoFactory, WagoValveBank};
pub use modbus::{ModbusTcpConnector, MODBUS_PORT};
