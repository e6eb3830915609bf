//! Fluigent MFCS-EZ pressure controller driver for the microfluidic rig.
//!
//! Controllers are reached through the vendor library via [`MfcsApi`]. The
//! crate ships a simulated library ([`SimulatedMfcs`]) and, with the
//! `mfcs_sdk` feature, a binding to the real one.
//!
//! ```rust,ignore
//! use mfc_driver_fluigent::MfcsEzFactory;
//!
//! registry.register_factory(Box::new(MfcsEzFactory::native()));
//! ```

pub mod api;
pub mod ez;
#[cfg(feature = "mfcs_sdk")]
pub mod sdk;
pub mod sim;

pub use api::{MfcsApi, MfcsError, MfcsHandle};
pub use ez::{MfcsEz, MfcsEzFactory, ALPHA, CHANNELS_PER_CONTROLLER};
pub use sim::SimulatedMfcs;
