//! Fluigent MFCS-EZ Pressure Controller Driver
//!
//! One driver spans any number of MFCS-EZ units, each with four pressure
//! channels. Global channel `n` lives on controller `(n - 1) / 4`, local
//! channel `n - 4 * controller`.
//!
//! Pressures are kept in mbar internally and converted to the driver's
//! display unit at the edges.
//!
//! Configuration arguments: controller serial numbers, in channel order.

use async_trait::async_trait;
use futures::future::BoxFuture;
use mfc_core::capabilities::{Driver, PressureControl, Setpoint};
use mfc_core::channel::{ChannelMap, ChannelTarget};
use mfc_core::driver::{ArgList, Capability, DeviceComponents, DriverFactory, DriverFamily};
use mfc_core::error::{RigError, RigResult};
use mfc_core::poller::PollerConfig;
use mfc_core::snapshot::{DeviceState, Snapshot, SnapshotCell};
use mfc_core::transport::Link;
use mfc_core::units::{PressureUnit, Unit};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::instrument;

use crate::api::{MfcsApi, MfcsHandle};

pub const CHANNELS_PER_CONTROLLER: u16 = 4;
/// Regulation constant applied to every channel at connect.
pub const ALPHA: u8 = 5;
/// Status byte of a primed controller.
const STATUS_READY: u8 = 1;

fn parse_serials(family: DriverFamily, args: &[toml::Value]) -> RigResult<Vec<u16>> {
    let serials = ArgList::new(family, args).strings_from(0, "serial")?;
    if serials.is_empty() {
        return Err(RigError::invalid_arguments(
            family,
            "at least one controller serial is required",
        ));
    }
    serials
        .iter()
        .map(|s| {
            s.parse::<u16>().map_err(|_| {
                RigError::invalid_arguments(family, format!("'{s}' is not a controller serial"))
            })
        })
        .collect()
}

// =============================================================================
// MfcsEzFactory - DriverFactory implementation
// =============================================================================

/// Builds [`MfcsEz`] drivers on top of one MFCS library.
pub struct MfcsEzFactory {
    family: DriverFamily,
    api: Arc<dyn MfcsApi>,
    settle_delay: Duration,
}

static MFCS_CAPABILITIES: &[Capability] = &[Capability::Pressure];

impl MfcsEzFactory {
    pub fn new(family: DriverFamily, api: Arc<dyn MfcsApi>) -> Self {
        Self {
            family,
            api,
            settle_delay: Duration::from_secs(1),
        }
    }

    /// Factory for the real controllers.
    #[cfg(feature = "mfcs_sdk")]
    pub fn native() -> Self {
        Self::new(
            DriverFamily::MfcsEz,
            Arc::new(crate::sdk::NativeMfcs::new()),
        )
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

impl DriverFactory for MfcsEzFactory {
    fn family(&self) -> DriverFamily {
        self.family
    }

    fn name(&self) -> &'static str {
        "Fluigent MFCS-EZ"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MFCS_CAPABILITIES
    }

    fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
        parse_serials(self.family, args).map(|_| ())
    }

    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        let family = self.family;
        let api = self.api.clone();
        let settle_delay = self.settle_delay;
        Box::pin(async move {
            let serials = parse_serials(family, &args)?;
            let driver =
                Arc::new(MfcsEz::new(family, api, serials).with_settle_delay(settle_delay));
            Ok(DeviceComponents::new(driver.clone()).with_pressure(driver))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::pressure()
    }
}

// =============================================================================
// MfcsEz
// =============================================================================

pub struct MfcsEz {
    family: DriverFamily,
    api: Arc<dyn MfcsApi>,
    serials: Vec<u16>,
    channels: ChannelMap,
    /// One handle per serial, in the same order
    link: Link<Vec<MfcsHandle>>,
    cell: SnapshotCell,
    unit: RwLock<PressureUnit>,
    settle_delay: Duration,
}

impl MfcsEz {
    pub fn new(family: DriverFamily, api: Arc<dyn MfcsApi>, serials: Vec<u16>) -> Self {
        let handles = u16::try_from(serials.len()).unwrap_or(u16::MAX);
        Self {
            family,
            api,
            channels: ChannelMap::new(handles, CHANNELS_PER_CONTROLLER),
            serials,
            link: Link::new(family),
            cell: SnapshotCell::new(),
            unit: RwLock::new(PressureUnit::CANONICAL),
            settle_delay: Duration::from_secs(1),
        }
    }

    /// Time the controllers get between initialisation and the status check.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn serials(&self) -> &[u16] {
        &self.serials
    }

    /// Run a blocking library call off the async runtime.
    async fn blocking<R, F>(&self, call: F) -> RigResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn MfcsApi) -> R + Send + 'static,
    {
        let api = self.api.clone();
        tokio::task::spawn_blocking(move || call(api.as_ref()))
            .await
            .map_err(|e| RigError::command(self.family, format!("library call panicked: {e}")))
    }

    /// Why a freshly initialised controller cannot be used, if it cannot.
    async fn check_ready(&self, serial: u16, handle: MfcsHandle) -> RigResult<Option<String>> {
        if !handle.is_valid() {
            return Ok(Some(format!("{serial}: controller not found")));
        }
        let (status, reported) = self
            .blocking(move |api| (api.status(handle), api.serial(handle)))
            .await?;
        Ok(match (status, reported) {
            (Err(e), _) | (Ok(STATUS_READY), Err(e)) => Some(format!("{serial}: {e}")),
            (Ok(STATUS_READY), Ok(reported)) if reported == serial => None,
            (Ok(STATUS_READY), Ok(reported)) => {
                Some(format!("{serial}: handle answers as controller {reported}"))
            }
            (Ok(0), _) => Some(format!(
                "{serial}: not primed, push the green button and reconnect"
            )),
            (Ok(other), _) => Some(format!("{serial}: unexpected status {other}")),
        })
    }

    /// Settle, check and configure freshly initialised controllers.
    async fn prepare(&self, handles: &[MfcsHandle]) -> RigResult<()> {
        tokio::time::sleep(self.settle_delay).await;

        let mut problems = Vec::new();
        for (serial, handle) in self.serials.iter().zip(handles) {
            if let Some(problem) = self.check_ready(*serial, *handle).await? {
                tracing::warn!(device = %self.family, serial, %problem, "controller not ready");
                problems.push(problem);
            }
        }
        if !problems.is_empty() {
            return Err(RigError::connection(self.family, problems.join("; ")));
        }

        let configured = handles.to_vec();
        let alpha_results = self
            .blocking(move |api| {
                configured
                    .into_iter()
                    .map(|handle| api.set_alpha(handle, 0, ALPHA))
                    .collect::<Vec<_>>()
            })
            .await?;
        for (serial, result) in self.serials.iter().zip(alpha_results) {
            if let Err(e) = result {
                tracing::warn!(device = %self.family, serial, error = %e, "could not set alpha");
            }
        }
        Ok(())
    }

    async fn release(&self, handles: Vec<MfcsHandle>) {
        let serials = self.serials.clone();
        let results = self
            .blocking(move |api| {
                handles
                    .into_iter()
                    .zip(serials)
                    .filter(|(handle, _)| handle.is_valid())
                    .map(|(handle, serial)| (serial, api.close(handle)))
                    .collect::<Vec<_>>()
            })
            .await;
        match results {
            Ok(results) => {
                for (serial, closed) in results {
                    if closed {
                        tracing::info!(device = %self.family, serial, "MFCS-EZ connection closed");
                    } else {
                        tracing::warn!(device = %self.family, serial, "failed to close MFCS-EZ connection");
                    }
                }
            }
            Err(e) => tracing::warn!(device = %self.family, error = %e, "error while closing"),
        }
    }

    /// Pair each global channel with its controller handle and local channel.
    fn route(&self, handles: &[MfcsHandle], channels: &[u16]) -> RigResult<Vec<Call>> {
        channels
            .iter()
            .map(|channel| -> RigResult<Call> {
                let address = self.channels.resolve(*channel)?;
                let handle = handles
                    .get(address.handle_index)
                    .copied()
                    .ok_or(RigError::NotConnected(self.family))?;
                Ok((*channel, handle, local(address.local_channel)))
            })
            .collect()
    }

    /// Read the targeted channels in mbar.
    async fn read_mbar(&self, channels: Vec<u16>) -> RigResult<Vec<f64>> {
        let handles = self.link.lock().await?;
        let calls = self.route(&handles, &channels)?;

        let readings = self
            .blocking(move |api| {
                calls
                    .into_iter()
                    .map(|(channel, handle, local)| (channel, api.read_channel(handle, local)))
                    .collect::<Vec<_>>()
            })
            .await?;
        drop(handles);

        readings
            .into_iter()
            .map(|(channel, reading)| {
                reading
                    .map(|(mbar, _timer)| f64::from(mbar))
                    .map_err(|e| RigError::command(self.family, format!("read channel {channel}: {e}")))
            })
            .collect()
    }

    async fn write_mbar(&self, channels: Vec<u16>, mbar: f64) -> RigResult<()> {
        let handles = self.link.lock().await?;
        let calls = self.route(&handles, &channels)?;

        let value = mbar as f32;
        let results = self
            .blocking(move |api| {
                calls
                    .into_iter()
                    .map(|(channel, handle, local)| (channel, api.set_pressure(handle, local, value)))
                    .collect::<Vec<_>>()
            })
            .await?;
        drop(handles);

        let failed: Vec<u16> = results
            .into_iter()
            .filter_map(|(channel, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(device = %self.family, channel, error = %e, "pressure write failed");
                    Some(channel)
                }
            })
            .collect();
        match (failed.as_slice(), channels.len()) {
            ([], _) => Ok(()),
            ([channel], 1) => Err(RigError::command(
                self.family,
                format!("write to channel {channel} failed"),
            )),
            _ => Err(RigError::PartialWrite {
                family: self.family,
                failed,
            }),
        }
    }
}

/// (global channel, controller handle, local channel)
type Call = (u16, MfcsHandle, u8);

/// Local channels are at most [`CHANNELS_PER_CONTROLLER`].
fn local(channel: u16) -> u8 {
    u8::try_from(channel).unwrap_or(u8::MAX)
}

#[async_trait]
impl Driver for MfcsEz {
    fn family(&self) -> DriverFamily {
        self.family
    }

    #[instrument(skip(self), fields(device = %self.family, serials = ?self.serials), err)]
    async fn connect(&self) -> RigResult<Unit> {
        self.link.ensure_detached()?;

        let serials = self.serials.clone();
        let handles = self
            .blocking(move |api| serials.iter().map(|s| api.initialise(*s)).collect::<Vec<_>>())
            .await?;

        // Until attached, these handles are ours to close on every failure
        let attached = match self.prepare(&handles).await {
            Ok(()) => self.link.attach(handles.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = attached {
            self.release(handles).await;
            return Err(e);
        }
        let pressures = self.read_mbar(self.channels.channels().collect()).await;
        match pressures {
            Ok(pressures) => {
                self.cell.publish(DeviceState::Pressure(pressures));
                tracing::info!(controllers = self.serials.len(), "MFCS-EZ initialized");
                Ok(self.unit())
            }
            Err(e) => {
                self.close().await;
                Err(RigError::connection(self.family, e.to_string()))
            }
        }
    }

    async fn close(&self) {
        if let Some(handles) = self.link.detach().await {
            self.release(handles).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn read_state(&self) -> RigResult<Snapshot> {
        let pressures = self.read_mbar(self.channels.channels().collect()).await?;
        Ok(self.cell.publish(DeviceState::Pressure(pressures)))
    }

    async fn apply(&self, target: ChannelTarget, setpoint: Setpoint) -> RigResult<()> {
        match setpoint {
            Setpoint::Pressure(value) => self.set_pressure(value, target, None).await,
            other => Err(other.unsupported(self.family)),
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.cell.latest()
    }

    fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.cell.subscribe()
    }

    fn unit(&self) -> Unit {
        Unit::Pressure(*self.unit.read())
    }

    fn set_unit(&self, unit: Unit) -> RigResult<()> {
        match unit {
            Unit::Pressure(pressure) => {
                self.set_pressure_unit(pressure);
                Ok(())
            }
            other => Err(other.incompatible(self.family)),
        }
    }
}

#[async_trait]
impl PressureControl for MfcsEz {
    fn channel_num(&self) -> u16 {
        self.channels.total()
    }

    #[instrument(skip(self), fields(device = %self.family, %target), err)]
    async fn set_pressure(
        &self,
        value: f64,
        target: ChannelTarget,
        unit: Option<PressureUnit>,
    ) -> RigResult<()> {
        let unit = unit.unwrap_or_else(|| self.pressure_unit());
        unit.check_setpoint(value)?;
        let channels = self.channels.expand(target)?;
        self.write_mbar(channels, unit.to_canonical(value)).await
    }

    async fn read_pressure(
        &self,
        target: ChannelTarget,
        unit: Option<PressureUnit>,
    ) -> RigResult<Vec<f64>> {
        let unit = unit.unwrap_or_else(|| self.pressure_unit());
        let channels = self.channels.expand(target)?;
        let mbar = self.read_mbar(channels).await?;
        Ok(mbar.into_iter().map(|p| unit.to_display(p)).collect())
    }

    fn pressure_unit(&self) -> PressureUnit {
        *self.unit.read()
    }

    fn set_pressure_unit(&self, unit: PressureUnit) {
        *self.unit.write() = unit;
    }
}
