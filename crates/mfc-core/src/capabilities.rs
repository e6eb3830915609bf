//! Driver contract and capability traits.
//!
//! Every hardware family implements [`Driver`]. On top of that a family
//! implements the capability trait matching what it controls:
//! [`ValveControl`], [`PressureControl`] or [`StageControl`].

use crate::channel::ChannelTarget;
use crate::driver::DriverFamily;
use crate::error::{RigError, RigResult};
use crate::snapshot::{Position, Snapshot};
use crate::units::{PressureUnit, Unit};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::watch;

// =============================================================================
// Setpoints
// =============================================================================

/// Value written by [`Driver::apply`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setpoint {
    /// Open (`true`) or close a valve
    Valve(bool),
    /// Pressure in the driver's current display unit
    Pressure(f64),
    /// Absolute stage move in mm
    MoveAbs { x: f64, y: f64 },
    /// Relative stage move in mm
    MoveRel { x: f64, y: f64 },
}

impl fmt::Display for Setpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valve(open) => write!(f, "valve {}", if *open { "open" } else { "closed" }),
            Self::Pressure(v) => write!(f, "pressure {v}"),
            Self::MoveAbs { x, y } => write!(f, "move to ({x}, {y})"),
            Self::MoveRel { x, y } => write!(f, "move by ({x}, {y})"),
        }
    }
}

impl Setpoint {
    pub fn unsupported(self, family: DriverFamily) -> RigError {
        RigError::UnsupportedSetpoint {
            family,
            setpoint: self.to_string(),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Uniform driver contract.
///
/// # Contract
/// - `connect` opens the transport and performs one-time initialisation. A
///   second call while connected fails with [`RigError::AlreadyConnected`].
/// - `close` never fails and may be called any number of times, including
///   before a successful `connect`.
/// - `read_state` refreshes every channel and atomically replaces the
///   published snapshot. It is bounded in time.
/// - `apply` writes and returns; the next `read_state` is the source of truth.
///
/// # Thread Safety
/// - Every method takes `&self`; the transport sits behind a lock held for one
///   command round trip, so the poller and foreground calls interleave at
///   command granularity.
#[async_trait]
pub trait Driver: Send + Sync {
    fn family(&self) -> DriverFamily;

    async fn connect(&self) -> RigResult<Unit>;

    async fn close(&self);

    /// Whether the transport is open.
    fn is_connected(&self) -> bool;

    async fn read_state(&self) -> RigResult<Snapshot>;

    async fn apply(&self, target: ChannelTarget, setpoint: Setpoint) -> RigResult<()>;

    /// Last published snapshot.
    fn snapshot(&self) -> Snapshot;

    fn subscribe(&self) -> watch::Receiver<Snapshot>;

    /// Current display unit.
    fn unit(&self) -> Unit;

    /// Change the display unit. Only units of the same quantity are accepted.
    fn set_unit(&self, unit: Unit) -> RigResult<()>;

    fn limit(&self) -> Option<f64> {
        self.unit().limit()
    }

    fn conversion_factor(&self) -> f64 {
        self.unit().factor()
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Read-back from a valve operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveReadback {
    Single(bool),
    All(Vec<bool>),
}

impl ValveReadback {
    /// True when every read-back valve is in `state`.
    pub fn matches(&self, state: bool) -> bool {
        match self {
            Self::Single(v) => *v == state,
            Self::All(v) => v.iter().all(|s| *s == state),
        }
    }

    pub fn into_vec(self) -> Vec<bool> {
        match self {
            Self::Single(v) => vec![v],
            Self::All(v) => v,
        }
    }
}

/// Capability: Valve Bank
///
/// # Contract
/// - Channels are 1-based, `1..=valve_num()`
/// - `valve_set` with [`ChannelTarget::All`] writes each channel in turn and
///   reports failures as [`RigError::PartialWrite`]
/// - Returned values are read back from the device after the write
#[async_trait]
pub trait ValveControl: Send + Sync {
    fn valve_num(&self) -> u16;

    /// Write `state` and return the post-write read-back.
    async fn valve_set(&self, state: bool, target: ChannelTarget) -> RigResult<ValveReadback>;

    async fn valve_read(&self, target: ChannelTarget) -> RigResult<ValveReadback>;

    /// Compare the device state against `state` without raising on mismatch.
    async fn valve_check(&self, state: bool, target: ChannelTarget) -> RigResult<bool> {
        Ok(self.valve_read(target).await?.matches(state))
    }

    /// Invert one valve and return its new state.
    async fn valve_switch(&self, channel: u16) -> RigResult<bool> {
        let current = self.valve_read(ChannelTarget::One(channel)).await?;
        let next = !current.matches(true);
        let readback = self.valve_set(next, ChannelTarget::One(channel)).await?;
        Ok(readback.matches(true))
    }

    async fn valve_on(&self, target: ChannelTarget) -> RigResult<ValveReadback> {
        self.valve_set(true, target).await
    }

    async fn valve_off(&self, target: ChannelTarget) -> RigResult<ValveReadback> {
        self.valve_set(false, target).await
    }
}

/// Capability: Pressure Control
///
/// # Contract
/// - Values are in the driver's pressure unit unless `unit` overrides it
/// - Setpoints outside `0..=limit` are rejected before anything is written
/// - `read_pressure` returns one value per targeted channel
#[async_trait]
pub trait PressureControl: Send + Sync {
    fn channel_num(&self) -> u16;

    async fn set_pressure(
        &self,
        value: f64,
        target: ChannelTarget,
        unit: Option<PressureUnit>,
    ) -> RigResult<()>;

    async fn read_pressure(
        &self,
        target: ChannelTarget,
        unit: Option<PressureUnit>,
    ) -> RigResult<Vec<f64>>;

    fn pressure_unit(&self) -> PressureUnit;

    fn set_pressure_unit(&self, unit: PressureUnit);
}

/// Capability: XY Stage
///
/// # Contract
/// - Positions and speeds are in mm and mm/s
/// - Moves block until the controller reports motion complete, then return
///   the refreshed position
/// - `stop` does not wait for the stage to settle
#[async_trait]
pub trait StageControl: Send + Sync {
    async fn move_abs(&self, x: f64, y: f64) -> RigResult<Position>;

    async fn move_rel(&self, dx: f64, dy: f64) -> RigResult<Position>;

    async fn home(&self) -> RigResult<Position> {
        self.move_abs(0.0, 0.0).await
    }

    async fn stop(&self) -> RigResult<()>;

    /// Declare the current position as the origin.
    async fn set_home(&self) -> RigResult<()>;

    /// Run the controller's limit-switch homing routine.
    async fn homing(&self) -> RigResult<Position>;

    async fn set_speed(&self, x: f64, y: f64) -> RigResult<()>;

    /// Current (x, y) speed in mm/s.
    async fn speed(&self) -> RigResult<(f64, f64)>;

    async fn position(&self) -> RigResult<Position>;
}
