//! Simulated MFCS library.
//!
//! Controllers are registered by serial number. Each regulates its four
//! channels instantly to the requested pressure and advances its timer on
//! every read.

use crate::api::{MfcsApi, MfcsError, MfcsHandle, MfcsResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error code returned for calls on a closed handle.
pub const CLOSED_HANDLE: u8 = 2;
/// Error code returned when a channel is out of range.
pub const BAD_CHANNEL: u8 = 3;

#[derive(Debug, Clone)]
struct Controller {
    primed: bool,
    pressures: [f32; 4],
    alpha: Option<u8>,
    timer: u16,
    failing_channel: Option<u8>,
    reports_as: Option<u16>,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            primed: true,
            pressures: [0.0; 4],
            alpha: None,
            timer: 0,
            failing_channel: None,
            reports_as: None,
        }
    }
}

#[derive(Debug, Default)]
struct Library {
    controllers: HashMap<u16, Controller>,
    /// Open handles and the serial each one addresses
    handles: HashMap<u64, u16>,
    next_handle: u64,
    closed: u32,
}

impl Library {
    fn controller(&mut self, handle: MfcsHandle) -> MfcsResult<&mut Controller> {
        let serial = *self
            .handles
            .get(&handle.0)
            .ok_or(MfcsError::Code(CLOSED_HANDLE))?;
        self.controllers
            .get_mut(&serial)
            .ok_or(MfcsError::InvalidHandle)
    }
}

fn channel_index(controller: &Controller, channel: u8) -> MfcsResult<usize> {
    if controller.failing_channel == Some(channel) {
        return Err(MfcsError::Code(BAD_CHANNEL));
    }
    match channel {
        1..=4 => Ok(usize::from(channel - 1)),
        _ => Err(MfcsError::Code(BAD_CHANNEL)),
    }
}

/// Shared simulated library. Clones see the same controllers.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMfcs {
    library: Arc<Mutex<Library>>,
}

impl SimulatedMfcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library with primed controllers for every serial.
    pub fn with_controllers(serials: &[u16]) -> Self {
        let sim = Self::new();
        for serial in serials {
            sim.plug(*serial);
        }
        sim
    }

    pub fn plug(&self, serial: u16) {
        self.library
            .lock()
            .controllers
            .insert(serial, Controller::default());
    }

    /// Leave the controller connected but not primed (status 0).
    pub fn unprime(&self, serial: u16) {
        if let Some(controller) = self.library.lock().controllers.get_mut(&serial) {
            controller.primed = false;
        }
    }

    /// Make every call on local `channel` of `serial` fail.
    pub fn fail_channel(&self, serial: u16, channel: u8) {
        if let Some(controller) = self.library.lock().controllers.get_mut(&serial) {
            controller.failing_channel = Some(channel);
        }
    }

    /// Make handles to `serial` report `reported` as their serial number.
    pub fn misreport_serial(&self, serial: u16, reported: u16) {
        if let Some(controller) = self.library.lock().controllers.get_mut(&serial) {
            controller.reports_as = Some(reported);
        }
    }

    /// Current pressure of local `channel` (1-based) in mbar.
    pub fn pressure(&self, serial: u16, channel: u8) -> Option<f32> {
        let library = self.library.lock();
        let controller = library.controllers.get(&serial)?;
        controller
            .pressures
            .get(usize::from(channel).checked_sub(1)?)
            .copied()
    }

    /// Force a reading, as if regulation drifted.
    pub fn set_reading(&self, serial: u16, channel: u8, mbar: f32) {
        let mut library = self.library.lock();
        if let Some(slot) = library
            .controllers
            .get_mut(&serial)
            .and_then(|c| c.pressures.get_mut(usize::from(channel).saturating_sub(1)))
        {
            *slot = mbar;
        }
    }

    pub fn alpha(&self, serial: u16) -> Option<u8> {
        self.library.lock().controllers.get(&serial)?.alpha
    }

    pub fn open_handles(&self) -> usize {
        self.library.lock().handles.len()
    }

    /// Successful `close` calls so far.
    pub fn closed(&self) -> u32 {
        self.library.lock().closed
    }
}

impl MfcsApi for SimulatedMfcs {
    fn initialise(&self, serial: u16) -> MfcsHandle {
        let mut library = self.library.lock();
        if !library.controllers.contains_key(&serial) {
            return MfcsHandle::INVALID;
        }
        library.next_handle += 1;
        let handle = library.next_handle;
        library.handles.insert(handle, serial);
        MfcsHandle(handle)
    }

    fn status(&self, handle: MfcsHandle) -> MfcsResult<u8> {
        let mut library = self.library.lock();
        Ok(u8::from(library.controller(handle)?.primed))
    }

    fn serial(&self, handle: MfcsHandle) -> MfcsResult<u16> {
        let mut library = self.library.lock();
        let serial = *library
            .handles
            .get(&handle.0)
            .ok_or(MfcsError::Code(CLOSED_HANDLE))?;
        Ok(library.controller(handle)?.reports_as.unwrap_or(serial))
    }

    fn set_alpha(&self, handle: MfcsHandle, channel: u8, alpha: u8) -> MfcsResult<()> {
        let mut library = self.library.lock();
        let controller = library.controller(handle)?;
        if channel != 0 {
            channel_index(controller, channel)?;
        }
        controller.alpha = Some(alpha);
        Ok(())
    }

    fn set_pressure(&self, handle: MfcsHandle, channel: u8, mbar: f32) -> MfcsResult<()> {
        let mut library = self.library.lock();
        let controller = library.controller(handle)?;
        let index = channel_index(controller, channel)?;
        controller.pressures[index] = mbar;
        Ok(())
    }

    fn read_channel(&self, handle: MfcsHandle, channel: u8) -> MfcsResult<(f32, u16)> {
        let mut library = self.library.lock();
        let controller = library.controller(handle)?;
        let index = channel_index(controller, channel)?;
        controller.timer = controller.timer.wrapping_add(1);
        Ok((controller.pressures[index], controller.timer))
    }

    fn close(&self, handle: MfcsHandle) -> bool {
        let mut library = self.library.lock();
        if library.handles.remove(&handle.0).is_some() {
            library.closed += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_serial_gives_invalid_handle() {
        let sim = SimulatedMfcs::with_controllers(&[1001]);
        assert!(!sim.initialise(2002).is_valid());
        assert!(sim.initialise(1001).is_valid());
    }

    #[test]
    fn set_then_read_with_advancing_timer() {
        let sim = SimulatedMfcs::with_controllers(&[1001]);
        let handle = sim.initialise(1001);
        sim.set_pressure(handle, 2, 150.0).unwrap();
        assert_eq!(sim.read_channel(handle, 2).unwrap(), (150.0, 1));
        assert_eq!(sim.read_channel(handle, 2).unwrap(), (150.0, 2));
        assert_eq!(sim.read_channel(handle, 5), Err(MfcsError::Code(BAD_CHANNEL)));
    }

    #[test]
    fn closed_handles_are_rejected() {
        let sim = SimulatedMfcs::with_controllers(&[1001]);
        let handle = sim.initialise(1001);
        assert!(sim.close(handle));
        assert!(!sim.close(handle));
        assert_eq!(sim.status(handle), Err(MfcsError::Code(CLOSED_HANDLE)));
        assert_eq!(sim.closed(), 1);
    }

    #[test]
    fn handles_report_their_serial() {
        let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
        let handle = sim.initialise(1002);
        assert_eq!(sim.serial(handle), Ok(1002));
        sim.misreport_serial(1002, 1003);
        assert_eq!(sim.serial(handle), Ok(1003));
    }
}
