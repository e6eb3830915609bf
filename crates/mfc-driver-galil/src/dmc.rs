//! Galil DMC Motion Controller Driver
//!
//! Reference: Galil DMC-21x3 Command Reference
//!
//! Protocol Overview:
//! - Transport: TCP port 23 when the address is an IP, otherwise a serial
//!   port at 115200 8N1
//! - Commands end with `\r`
//! - Accepted commands answer with optional data lines and a final `:`,
//!   rejected ones with a bare `?`
//! - After a `?`, `TC1` returns the numeric reason; code 7 ("not valid while
//!   running") means the controller is busy and the command is retried
//! - Motion in progress is read from `MG _BGA, _BGB`
//!
//! Axis A is the X axis, axis B the Y axis. Their encoders have different
//! resolutions, see [`X_COUNTS_PER_MM`] and [`Y_COUNTS_PER_MM`].

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
    read_reply, resync, write_line, Connector, LinePort, Link, SerialConnector, TcpConnector,
};
use mfc_core::units::Unit;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::instrument;

/// Encoder counts per millimetre on axis A.
pub const X_COUNTS_PER_MM: f64 = 2012.072;
/// Encoder counts per millimetre on axis B.
pub const Y_COUNTS_PER_MM: f64 = 402.317;
/// Slowest speed the driver will request, mm/s.
pub const MIN_SPEED_MM_S: f64 = 1.0;
pub const TCP_PORT: u16 = 23;
pub const BAUD_RATE: u32 = 115_200;

/// `TC1` code for "command not valid while running".
const BUSY_CODE: u32 = 7;
const TERMINATOR: &str = "\r";
const RESYNC_WINDOW: Duration = Duration::from_millis(20);

/// All numbers in a reply such as ` 2012, 402` or ` 1.0000 0.0000`.
pub fn parse_numbers(reply: &str) -> Vec<f64> {
    reply
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|token| token.parse().ok())
        .collect()
}

fn counts(mm: f64, per_mm: f64) -> i64 {
    (mm * per_mm).round() as i64
}

/// Pick TCP for IP addresses and serial for everything else.
pub fn connector_for(address: &str) -> Box<dyn Connector> {
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Box::new(TcpConnector::new(socket.to_string()));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Box::new(TcpConnector::new(SocketAddr::new(ip, TCP_PORT).to_string()));
    }
    Box::new(SerialConnector::new(address, BAUD_RATE))
}

// =============================================================================
// GalilFactory - DriverFactory implementation
// =============================================================================

/// Builds [`GalilController`] drivers from `[address]`.
pub struct GalilFactory;

static GALIL_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for GalilFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::Galil
    }

    fn name(&self) -> &'static str {
        "Galil DMC Motion Controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        GALIL_CAPABILITIES
    }

    fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
        ArgList::new(self.family(), args).string(0, "address")?;
        Ok(())
    }

    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let address = ArgList::new(DriverFamily::Galil, &args).string(0, "address")?;
            let controller = Arc::new(GalilController::new(&address));
            Ok(DeviceComponents::new(controller.clone()).with_stage(controller))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::stage()
    }
}

// =============================================================================
// GalilController
// =============================================================================

enum Outcome {
    Accepted(String),
    Busy,
    Rejected(u32, String),
}

/// Driver for a two-axis Galil DMC controller.
pub struct GalilController {
    family: DriverFamily,
    connector: Box<dyn Connector>,
    link: Link<LinePort>,
    cell: SnapshotCell,
    /// Retry budget for commands refused while running
    busy_policy: BusyPolicy,
    /// Wait for motion to finish after a move
    settle_policy: BusyPolicy,
    io_timeout: Duration,
}

impl GalilController {
    /// Controller at an IP address (TCP) or serial path.
    pub fn new(address: &str) -> Self {
        Self::from_boxed(DriverFamily::Galil, connector_for(address))
    }

    pub fn with_connector(family: DriverFamily, connector: impl Connector + 'static) -> Self {
        Self::from_boxed(family, Box::new(connector))
    }

    fn from_boxed(family: DriverFamily, connector: Box<dyn Connector>) -> Self {
        Self {
            family,
            connector,
            link: Link::new(family),
            cell: SnapshotCell::new(),
            busy_policy: BusyPolicy::default(),
            settle_policy: BusyPolicy::motion(),
            io_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_policies(mut self, busy: BusyPolicy, settle: BusyPolicy) -> Self {
        self.busy_policy = busy;
        self.settle_policy = settle;
        self
    }

    /// Where this controller connects to.
    pub fn address(&self) -> String {
        self.connector.describe()
    }

    async fn exchange(&self, port: &mut LinePort, command: &str) -> std::io::Result<(String, u8)> {
        write_line(port, command, TERMINATOR).await?;
        read_reply(port, b":?", self.io_timeout).await
    }

    /// One command, plus the `TC1` follow-up when rejected, under one lock.
    async fn try_command(&self, command: &str) -> RigResult<Outcome> {
        let mut guard = self.link.lock().await?;
        let port = &mut *guard;
        tracing::debug!(device = %self.family, command, ">>");

        let outcome = match self.exchange(port, command).await {
            Ok((reply, b':')) => {
                let reply = reply.trim().to_string();
                tracing::debug!(device = %self.family, %reply, "<<");
                Ok(Outcome::Accepted(reply))
            }
            Ok(_) => match self.exchange(port, "TC1").await {
                Ok((reason, _)) => {
                    let reason = reason.trim().to_string();
                    let code = parse_numbers(&reason)
                        .first()
                        .map_or(0, |code| *code as u32);
                    tracing::debug!(device = %self.family, code, %reason, "rejected");
                    if code == BUSY_CODE {
                        Ok(Outcome::Busy)
                    } else {
                        Ok(Outcome::Rejected(code, reason))
                    }
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                resync(port, RESYNC_WINDOW).await;
                Err(RigError::command(self.family, format!("{command}: {e}")))
            }
        }
    }

    /// Send `command`, retrying while the controller reports it is running.
    async fn command(&self, command: &str) -> RigResult<String> {
        let reply = Mutex::new(None);
        let slot = &reply;
        self.busy_policy
            .wait_while_busy(self.family, command, move || async move {
                match self.try_command(command).await? {
                    Outcome::Accepted(text) => {
                        *slot.lock() = Some(text);
                        Ok(false)
                    }
                    Outcome::Busy => Ok(true),
                    Outcome::Rejected(code, reason) => Err(RigError::command(
                        self.family,
                        format!("{command} rejected ({code}): {reason}"),
                    )),
                }
            })
            .await?;
        Ok(reply.into_inner().unwrap_or_default())
    }

    async fn query_numbers(&self, command: &str, expected: usize) -> RigResult<Vec<f64>> {
        let reply = self.command(command).await?;
        let values = parse_numbers(&reply);
        if values.len() < expected {
            return Err(RigError::command(
                self.family,
                format!("{command}: unparseable reply '{reply}'"),
            ));
        }
        Ok(values)
    }

    async fn in_motion(&self) -> RigResult<bool> {
        let flags = self.query_numbers("MG _BGA, _BGB", 2).await?;
        Ok(flags.iter().any(|flag| *flag != 0.0))
    }

    async fn settle(&self) -> RigResult<()> {
        self.settle_policy
            .wait_while_busy(self.family, "motion", move || self.in_motion())
            .await
    }

    async fn refresh_position(&self) -> RigResult<Position> {
        let x = self.query_numbers("TPA", 1).await?[0] / X_COUNTS_PER_MM;
        let y = self.query_numbers("TPB", 1).await?[0] / Y_COUNTS_PER_MM;
        let position = Position::new(x, y);
        self.cell.publish(DeviceState::Position(position));
        Ok(position)
    }

    async fn begin_and_settle(&self, setup: String) -> RigResult<Position> {
        self.command(&setup).await?;
        self.command("BG X,Y").await?;
        self.settle().await?;
        let position = self.refresh_position().await?;
        tracing::info!(device = %self.family, x = position.x, y = position.y, "move complete");
        Ok(position)
    }
}

#[async_trait]
impl Driver for GalilController {
    fn family(&self) -> DriverFamily {
        self.family
    }

    #[instrument(skip(self), fields(device = %self.family, address = %self.connector.describe()), err)]
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

        let init = async {
            // Echo off, then both limit switches active high
            self.command("EO 0").await?;
            self.command("CN 1,1").await?;
            self.refresh_position().await
        };
        match init.await {
            Ok(position) => {
                tracing::info!(x = position.x, y = position.y, "Galil controller connected");
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
                tracing::warn!(device = %self.family, error = %e, "error while closing connection");
            }
            tracing::info!(device = %self.family, "Galil connection closed");
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
impl StageControl for GalilController {
    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn move_abs(&self, x: f64, y: f64) -> RigResult<Position> {
        let (a, b) = (counts(x, X_COUNTS_PER_MM), counts(y, Y_COUNTS_PER_MM));
        self.begin_and_settle(format!("PA {a},{b}")).await
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn move_rel(&self, dx: f64, dy: f64) -> RigResult<Position> {
        let (a, b) = (counts(dx, X_COUNTS_PER_MM), counts(dy, Y_COUNTS_PER_MM));
        self.begin_and_settle(format!("PR {a},{b}")).await
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn stop(&self) -> RigResult<()> {
        tracing::info!(device = %self.family, "STOP");
        self.command("ST").await.map(|_| ())
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn set_home(&self) -> RigResult<()> {
        self.command("DP 0,0").await?;
        self.refresh_position().await.map(|_| ())
    }

    /// Home axis A, then axis B.
    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn homing(&self) -> RigResult<Position> {
        self.command("HM").await?;
        tracing::info!(device = %self.family, "homing X axis");
        self.command("BGA").await?;
        self.settle().await?;
        tracing::info!(device = %self.family, "homing Y axis");
        self.command("BGB").await?;
        self.settle().await?;
        self.refresh_position().await
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn set_speed(&self, x: f64, y: f64) -> RigResult<()> {
        if x.is_nan() || y.is_nan() {
            return Err(RigError::OutOfRange {
                value: f64::NAN,
                limit: MIN_SPEED_MM_S,
                unit: "mm/s".to_string(),
            });
        }
        let a = counts(x.max(MIN_SPEED_MM_S), X_COUNTS_PER_MM);
        let b = counts(y.max(MIN_SPEED_MM_S), Y_COUNTS_PER_MM);
        self.command(&format!("SP {a},{b}")).await.map(|_| ())
    }

    async fn speed(&self) -> RigResult<(f64, f64)> {
        let values = self.query_numbers("SP ?,?", 2).await?;
        Ok((values[0] / X_COUNTS_PER_MM, values[1] / Y_COUNTS_PER_MM))
    }

    async fn position(&self) -> RigResult<Position> {
        self.refresh_position().await
    }
}
