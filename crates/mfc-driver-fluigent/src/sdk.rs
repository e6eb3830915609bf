//! [`MfcsApi`] backed by the vendor library.
#![allow(unsafe_code)]

use crate::api::{check, MfcsApi, MfcsError, MfcsHandle, MfcsResult};
use parking_lot::Mutex;
use std::os::raw::{c_char, c_float, c_ulong, c_ushort};

/// The vendor library, with every call serialized.
#[derive(Debug, Default)]
pub struct NativeMfcs {
    ffi_lock: Mutex<()>,
}

impl NativeMfcs {
    pub fn new() -> Self {
        Self::default()
    }
}

fn raw(handle: MfcsHandle) -> MfcsResult<c_ulong> {
    if !handle.is_valid() {
        return Err(MfcsError::InvalidHandle);
    }
    c_ulong::try_from(handle.0).map_err(|_| MfcsError::InvalidHandle)
}

impl MfcsApi for NativeMfcs {
    fn initialise(&self, serial: u16) -> MfcsHandle {
        let _guard = self.ffi_lock.lock();
        // SAFETY: plain value argument, no pointers involved
        let handle = unsafe { mfcs_sys::mfcsez_initialisation(serial) };
        MfcsHandle(u64::from(handle))
    }

    fn status(&self, handle: MfcsHandle) -> MfcsResult<u8> {
        let handle = raw(handle)?;
        let mut status: c_char = 0;
        let _guard = self.ffi_lock.lock();
        // SAFETY: status points to a live local for the duration of the call
        check(unsafe { mfcs_sys::mfcs_get_status(handle, &mut status) })?;
        Ok(status as u8)
    }

    fn serial(&self, handle: MfcsHandle) -> MfcsResult<u16> {
        let handle = raw(handle)?;
        let mut serial: c_ushort = 0;
        let _guard = self.ffi_lock.lock();
        // SAFETY: serial points to a live local for the duration of the call
        check(unsafe { mfcs_sys::mfcs_get_serial(handle, &mut serial) })?;
        Ok(serial)
    }

    fn set_alpha(&self, handle: MfcsHandle, channel: u8, alpha: u8) -> MfcsResult<()> {
        let handle = raw(handle)?;
        let _guard = self.ffi_lock.lock();
        // SAFETY: value arguments only
        check(unsafe { mfcs_sys::mfcs_set_alpha(handle, channel, alpha) })
    }

    fn set_pressure(&self, handle: MfcsHandle, channel: u8, mbar: f32) -> MfcsResult<()> {
        let handle = raw(handle)?;
        let _guard = self.ffi_lock.lock();
        // SAFETY: value arguments only
        check(unsafe { mfcs_sys::mfcs_set_auto(handle, channel, mbar as c_float) })
    }

    fn read_channel(&self, handle: MfcsHandle, channel: u8) -> MfcsResult<(f32, u16)> {
        let handle = raw(handle)?;
        let mut pressure: c_float = 0.0;
        let mut timer: c_ushort = 0;
        let _guard = self.ffi_lock.lock();
        // SAFETY: both out-pointers reference live locals
        check(unsafe { mfcs_sys::mfcs_read_chan(handle, channel, &mut pressure, &mut timer) })?;
        Ok((pressure, timer))
    }

    fn close(&self, handle: MfcsHandle) -> bool {
        let Ok(handle) = raw(handle) else {
            return false;
        };
        let _guard = self.ffi_lock.lock();
        // SAFETY: value argument only; the handle is not used again
        unsafe { mfcs_sys::mfcs_close(handle) != 0 }
    }
}
