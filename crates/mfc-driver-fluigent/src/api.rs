//! Safe, blocking view of the MFCS library.

use thiserror::Error;

/// Controller handle returned by [`MfcsApi::initialise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MfcsHandle(pub u64);

impl MfcsHandle {
    pub const INVALID: MfcsHandle = MfcsHandle(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MfcsError {
    #[error("MFCS library returned error code {0}")]
    Code(u8),
    #[error("invalid controller handle")]
    InvalidHandle,
}

pub type MfcsResult<T> = Result<T, MfcsError>;

/// Blocking calls into the vendor library.
///
/// Channels are local to one controller and 1-based; channel `0` in
/// [`set_alpha`](MfcsApi::set_alpha) addresses every channel.
pub trait MfcsApi: Send + Sync + 'static {
    /// Open the controller with serial number `serial`.
    fn initialise(&self, serial: u16) -> MfcsHandle;

    /// Status byte; `1` means primed and ready.
    fn status(&self, handle: MfcsHandle) -> MfcsResult<u8>;

    fn serial(&self, handle: MfcsHandle) -> MfcsResult<u16>;

    fn set_alpha(&self, handle: MfcsHandle, channel: u8, alpha: u8) -> MfcsResult<()>;

    /// Regulate `channel` to `mbar`.
    fn set_pressure(&self, handle: MfcsHandle, channel: u8, mbar: f32) -> MfcsResult<()>;

    /// Pressure in mbar and the controller's timer counter.
    fn read_channel(&self, handle: MfcsHandle, channel: u8) -> MfcsResult<(f32, u16)>;

    /// Release the handle. Returns whether the library reported success.
    fn close(&self, handle: MfcsHandle) -> bool;
}

/// Map a vendor return code to a result.
pub fn check(code: u8) -> MfcsResult<()> {
    match code {
        0 => Ok(()),
        code => Err(MfcsError::Code(code)),
    }
}
