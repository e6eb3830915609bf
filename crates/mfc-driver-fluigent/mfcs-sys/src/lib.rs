//! Low-level FFI declarations for the Fluigent MFCS SDK (`mfcs64`).
//!
//! # Safety
//!
//! Every function is a raw vendor call. Handles come from
//! [`mfcsez_initialisation`]; a handle of `0` is invalid. The library is not
//! documented as thread safe, so callers must serialize access per handle.
//! For a safe wrapper, use the `mfc-driver-fluigent` crate.
//!
//! # Return codes
//!
//! Functions returning `c_uchar` return `0` on success and a vendor error
//! code otherwise. [`mfcs_close`] returns a boolean (non-zero on success).

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_float, c_uchar, c_ulong, c_ushort};

/// Opaque controller handle.
pub type mfcs_handle = c_ulong;

extern "C" {
    /// Open the controller with serial number `serial`. Returns `0` on failure.
    pub fn mfcsez_initialisation(serial: c_ushort) -> mfcs_handle;

    /// Write the controller status byte; `1` means primed and ready.
    pub fn mfcs_get_status(handle: mfcs_handle, status: *mut c_char) -> c_uchar;

    pub fn mfcs_get_serial(handle: mfcs_handle, serial: *mut c_ushort) -> c_uchar;

    /// Set the regulation constant. Channel `0` addresses every channel.
    pub fn mfcs_set_alpha(handle: mfcs_handle, channel: c_uchar, alpha: c_uchar) -> c_uchar;

    /// Regulate `channel` (1-based) to `pressure` mbar.
    pub fn mfcs_set_auto(handle: mfcs_handle, channel: c_uchar, pressure: c_float) -> c_uchar;

    /// Read `channel` (1-based) in mbar, with the controller's timer counter.
    pub fn mfcs_read_chan(
        handle: mfcs_handle,
        channel: c_uchar,
        pressure: *mut c_float,
        timer: *mut c_ushort,
    ) -> c_uchar;

    pub fn mfcs_close(handle: mfcs_handle) -> c_uchar;
}
