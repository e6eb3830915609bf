//! ASI MS-2000 XY Stage Driver
//!
//! Reference: ASI MS-2000 Programming Manual (Tiger/MS-2000 serial commands)
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232, card address prefix `2H`
//! - Baud: 115200, 8N1, no flow control
//! - Commands end with `\r`, replies end with `\r\n`
//! - `2H STATUS` answers `B` while any axis is moving, `N` when idle
//! - Errors come back as `:N-<code>`
//! - Positions are in encoder counts, 10000 counts/mm on both axes
//!
//! Every command is preceded by a bounded STATUS busy-wait. Moves then wait
//! for motion to finish and refresh the published position, so `move_abs`,
//! `move_rel` and `home` return only once the stage has stopped.

use async_trait::async_trait;
use futures::future::BoxFuture;
use mfc_core::busy::BusyPolicy;
use mfc_core::capabilities::{Driver, Setpoint, StageControl};
use mfc_core::channel::ChannelTarget;
use mfc_core::driver::{ArgList, Capability, DeviceComponents, DriverFactory, DriverFamily};
use mfc_core::error::{RigError, RigResult};
use mfc_core::poller::PollerConfig;
use mfc_core::snapshot::{DeviceState, Position, Snapshot, SnapshotCell};
use mfc_core::transport::{
    read_reply, resync, write_line, Connector, LinePort, Link, SerialConnector,
};
use mfc_core::units::Unit;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::instrument;

/// Encoder counts per millimetre, both axes.
pub const COUNTS_PER_MM: f64 = 10_000.0;
/// Fastest speed the controller accepts, mm/s.
pub const MAX_SPEED_MM_S: f64 = 8.6;
pub const BAUD_RATE: u32 = 115_200;

const TERMINATOR: &str = "\r";
const RESYNC_WINDOW: Duration = Duration::from_millis(20);

static NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("Invalid number regex"));

/// First decimal number in a reply such as `:A 12345.6` or `:A X=5.745760`.
pub fn parse_number(reply: &str) -> Option<f64> {
    NUMBER_REGEX
        .find(reply)
        .and_then(|m| m.as_str().parse().ok())
}

fn counts(mm: f64) -> String {
    format!("{:.1}", mm * COUNTS_PER_MM)
}

// =============================================================================
// AsiFactory - DriverFactory implementation
// =============================================================================

/// Builds [`AsiStage`] drivers from `[port]`.
pub struct AsiFactory;

static ASI_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for AsiFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::Asi
    }

    fn name(&self) -> &'static str {
        "ASI MS-2000 XY Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ASI_CAPABILITIES
    }

    fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
        ArgList::new(self.family(), args).string(0, "port")?;
        Ok(())
    }

    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let port = ArgList::new(DriverFamily::Asi, &args).string(0, "port")?;
            let stage = Arc::new(AsiStage::new(&port));
            Ok(DeviceComponents::new(stage.clone()).with_stage(stage))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::stage()
    }
}

// =============================================================================
// AsiStage
// =============================================================================

/// Driver for the ASI MS-2000 two-axis stage controller.
pub struct AsiStage {
    family: DriverFamily,
    connector: Box<dyn Connector>,
    link: Link<LinePort>,
    cell: SnapshotCell,
    /// Wait before each command
    status_policy: BusyPolicy,
    /// Wait for motion to finish after a move
    settle_policy: BusyPolicy,
    io_timeout: Duration,
}

impl AsiStage {
    /// Stage on a serial port, e.g. `COM4` or `/dev/ttyUSB0`.
    pub fn new(port: &str) -> Self {
        Self::with_connector(DriverFamily::Asi, SerialConnector::new(port, BAUD_RATE))
    }

    pub fn with_connector(family: DriverFamily, connector: impl Connector + 'static) -> Self {
        Self {
            family,
            connector: Box::new(connector),
            link: Link::new(family),
            cell: SnapshotCell::new(),
            status_policy: BusyPolicy::default(),
            settle_policy: BusyPolicy::motion(),
            io_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_policies(mut self, status: BusyPolicy, settle: BusyPolicy) -> Self {
        self.status_policy = status;
        self.settle_policy = settle;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// One write/read exchange under the transport lock.
    async fn round_trip(&self, command: &str) -> RigResult<String> {
        let mut guard = self.link.lock().await?;
        let port = &mut *guard;

        tracing::debug!(device = %self.family, command, ">>");
        let exchange = match write_line(port, command, TERMINATOR).await {
            Ok(()) => read_reply(port, b"\n", self.io_timeout).await,
            Err(e) => Err(e),
        };

        match exchange {
            Ok((reply, _)) => {
                let reply = reply.trim().to_string();
                tracing::debug!(device = %self.family, %reply, "<<");
                if reply.starts_with(":N") {
                    return Err(RigError::command(
                        self.family,
                        format!("{command} rejected: {reply}"),
                    ));
                }
                Ok(reply)
            }
            Err(e) => {
                let discarded = resync(port, RESYNC_WINDOW).await;
                if discarded > 0 {
                    tracing::debug!(device = %self.family, discarded, "discarded stale bytes");
                }
                Err(RigError::command(self.family, format!("{command}: {e}")))
            }
        }
    }

    async fn is_busy(&self) -> RigResult<bool> {
        Ok(self.round_trip("2H STATUS").await?.contains('B'))
    }

    /// Send `command`, first waiting out any busy state when `wait` is set.
    async fn command(&self, command: &str, wait: bool) -> RigResult<String> {
        if wait {
            self.status_policy
                .wait_while_busy(self.family, command, move || self.is_busy())
                .await?;
        }
        self.round_trip(command).await
    }

    async fn settle(&self) -> RigResult<()> {
        self.settle_policy
            .wait_while_busy(self.family, "motion", move || self.is_busy())
            .await
    }

    async fn query_number(&self, command: &str) -> RigResult<f64> {
        let reply = self.command(command, true).await?;
        parse_number(&reply).ok_or_else(|| {
            RigError::command(self.family, format!("{command}: unparseable reply '{reply}'"))
        })
    }

    async fn refresh_position(&self) -> RigResult<Position> {
        let x = self.query_number("2H W X").await? / COUNTS_PER_MM;
        let y = self.query_number("2H W Y").await? / COUNTS_PER_MM;
        let position = Position::new(x, y);
        self.cell.publish(DeviceState::Position(position));
        Ok(position)
    }

    async fn move_and_settle(&self, command: String) -> RigResult<Position> {
        self.command(&command, true).await?;
        self.settle().await?;
        let position = self.refresh_position().await?;
        tracing::info!(device = %self.family, x = position.x, y = position.y, "move complete");
        Ok(position)
    }
}

#[async_trait]
impl Driver for AsiStage {
    fn family(&self) -> DriverFamily {
        self.family
    }

    #[instrument(skip(self), fields(device = %self.family, port = %self.connector.describe()), err)]
    async fn connect(&self) -> RigResult<Unit> {
        self.link.ensure_detached()?;
        let stream = self
            .connector
            .open()
            .await
            .map_err(|e| RigError::connection(self.family, e.to_string()))?;

        let mut port = BufReader::new(stream);
        resync(&mut port, RESYNC_WINDOW).await;
        self.link.attach(port).await?;

        // Enable both motors before anything else
        let init = async {
            self.command("2H MC X+ Y+", true).await?;
            self.refresh_position().await
        };
        match init.await {
            Ok(position) => {
                tracing::info!(x = position.x, y = position.y, "ASI stage connected");
                Ok(Unit::Millimeter)
            }
            Err(e) => {
                self.close().await;
                Err(RigError::connection(self.family, e.to_string()))
            }
        }
    }

    async fn close(&self) {
        if let Some(mut port) = self.link.detach().await {
            if let Err(e) = port.get_mut().shutdown().await {
                tracing::warn!(device = %self.family, error = %e, "error while closing port");
            }
            tracing::info!(device = %self.family, "ASI stage connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn read_state(&self) -> RigResult<Snapshot> {
        self.refresh_position().await?;
        Ok(self.cell.latest())
    }

    /// Stages move both axes together; `target` is ignored.
    async fn apply(&self, _target: ChannelTarget, setpoint: Setpoint) -> RigResult<()> {
        match setpoint {
            Setpoint::MoveAbs { x, y } => self.move_abs(x, y).await.map(|_| ()),
            Setpoint::MoveRel { x, y } => self.move_rel(x, y).await.map(|_| ()),
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
        Unit::Millimeter
    }

    fn set_unit(&self, unit: Unit) -> RigResult<()> {
        if unit == Unit::Millimeter {
            Ok(())
        } else {
            Err(unit.incompatible(self.family))
        }
    }
}

#[async_trait]
impl StageControl for AsiStage {
    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn move_abs(&self, x: f64, y: f64) -> RigResult<Position> {
        self.move_and_settle(format!("2H M X={} Y={}", counts(x), counts(y)))
            .await
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn move_rel(&self, dx: f64, dy: f64) -> RigResult<Position> {
        self.move_and_settle(format!("2H R X={} Y={}", counts(dx), counts(dy)))
            .await
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn stop(&self) -> RigResult<()> {
        tracing::info!(device = %self.family, "HALT");
        self.command("2H HALT", false).await.map(|_| ())
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn set_home(&self) -> RigResult<()> {
        self.command("2H HERE X Y", true).await?;
        self.refresh_position().await.map(|_| ())
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn homing(&self) -> RigResult<Position> {
        self.move_and_settle("2H HOME X Y".to_string()).await
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn set_speed(&self, x: f64, y: f64) -> RigResult<()> {
        for value in [x, y] {
            if value.is_nan() || value < 0.0 {
                return Err(RigError::OutOfRange {
                    value,
                    limit: MAX_SPEED_MM_S,
                    unit: "mm/s".to_string(),
                });
            }
        }
        let (x, y) = (x.min(MAX_SPEED_MM_S), y.min(MAX_SPEED_MM_S));
        self.command(&format!("2H S X={x:.1} Y={y:.1}"), true)
            .await
            .map(|_| ())
    }

    async fn speed(&self) -> RigResult<(f64, f64)> {
        let x = self.query_number("2H S X?").await?;
        let y = self.query_number("2H S Y?").await?;
        Ok((x, y))
    }

    async fn position(&self) -> RigResult<Position> {
        self.refresh_position().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_pulled_from_replies() {
        assert_eq!(parse_number(":A 12345.6"), Some(12345.6));
        assert_eq!(parse_number(":A -500.0"), Some(-500.0));
        assert_eq!(parse_number(":A X=5.745760"), Some(5.74576));
        assert_eq!(parse_number(":A"), None);
    }

    #[test]
    fn millimetres_become_counts() {
        assert_eq!(counts(1.5), "15000.0");
        assert_eq!(counts(-0.25), "-2500.0");
        assert_eq!(counts(0.0), "0.0");
    }

    #[test]
    fn factory_metadata() {
        let factory = AsiFactory;
        assert_eq!(factory.family(), DriverFamily::Asi);
        assert!(factory.capabilities().contains(&Capability::Stage));
        assert_eq!(factory.default_poll(), PollerConfig::stage());
    }

    #[test]
    fn factory_requires_a_port() {
        let factory = AsiFactory;
        assert!(factory.validate(&[toml::Value::String("COM4".into())]).is_ok());
        assert!(matches!(
            factory.validate(&[]),
            Err(RigError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn only_millimetres_are_accepted() {
        let stage = AsiStage::new("COM4");
        assert!(stage.set_unit(Unit::Millimeter).is_ok());
        assert!(matches!(
            stage.set_unit(Unit::OpenClosed),
            Err(RigError::IncompatibleUnit { .. })
        ));
        assert_eq!(stage.conversion_factor(), 1.0);
        assert_eq!(stage.limit(), None);
    }
}
