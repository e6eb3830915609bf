//! WAGO 750 Valve Bank Driver
//!
//! Protocol Overview:
//! - Transport: Modbus TCP, port 502
//! - One output coil per valve, 1-based channel `n` written at
//!   `write_base + n - 1` (function code 5)
//! - Read back as one block of `valve_num` coils starting at the process
//!   image address `reg_addr` (function code 1)
//!
//! Configuration arguments: `[ip, valve_num, reg_addr, write_base?]`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use mfc_core::capabilities::{Driver, Setpoint, ValveControl, ValveReadback};
use mfc_core::channel::{ChannelMap, ChannelTarget};
use mfc_core::driver::{ArgList, Capability, DeviceComponents, DriverFactory, DriverFamily};
use mfc_core::error::{RigError, RigResult};
use mfc_core::poller::PollerConfig;
use mfc_core::snapshot::{DeviceState, Snapshot, SnapshotCell};
use mfc_core::transport::{CoilConnector, DynCoilBus, Link};
use mfc_core::units::Unit;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

use crate::modbus::ModbusTcpConnector;

/// Coil addressing of one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoilLayout {
    pub valve_num: u16,
    /// First coil of the read-back block
    pub read_base: u16,
    /// Coil written for channel 1
    pub write_base: u16,
}

impl CoilLayout {
    pub fn new(valve_num: u16, read_base: u16) -> Self {
        Self {
            valve_num,
            read_base,
            write_base: 0,
        }
    }

    pub fn with_write_base(mut self, write_base: u16) -> Self {
        self.write_base = write_base;
        self
    }

    /// Coil written for `channel`; `None` past the 16-bit coil space.
    fn write_address(&self, channel: u16) -> Option<u16> {
        self.write_base.checked_add(channel.checked_sub(1)?)
    }

    /// Both coil blocks must end at or before coil 65535.
    pub fn check(&self, family: DriverFamily) -> RigResult<()> {
        let span = self.valve_num.saturating_sub(1);
        for (name, base) in [("reg_addr", self.read_base), ("write_base", self.write_base)] {
            if base.checked_add(span).is_none() {
                return Err(RigError::invalid_arguments(
                    family,
                    format!("{name} {base} with {} valves runs past coil 65535", self.valve_num),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// WagoFactory - DriverFactory implementation
// =============================================================================

pub struct WagoFactory;

static WAGO_CAPABILITIES: &[Capability] = &[Capability::Valves];

fn layout_from(args: &ArgList<'_>) -> RigResult<CoilLayout> {
    let narrow = |value: u32, name: &str| {
        u16::try_from(value).map_err(|_| {
            RigError::invalid_arguments(DriverFamily::Wago, format!("{name} {value} is too large"))
        })
    };
    let valve_num = narrow(args.integer(1, "valve_num")?, "valve_num")?;
    if valve_num == 0 {
        return Err(RigError::invalid_arguments(
            DriverFamily::Wago,
            "valve_num must be at least 1",
        ));
    }
    let read_base = narrow(args.integer(2, "reg_addr")?, "reg_addr")?;
    let write_base = match args.optional_integer(3, "write_base")? {
        Some(base) => narrow(base, "write_base")?,
        None => 0,
    };
    let layout = CoilLayout::new(valve_num, read_base).with_write_base(write_base);
    layout.check(DriverFamily::Wago)?;
    Ok(layout)
}

impl DriverFactory for WagoFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::Wago
    }

    fn name(&self) -> &'static str {
        "WAGO 750 Valve Bank"
    }

    fn capabilities(&self) -> &'static [Capability] {
        WAGO_CAPABILITIES
    }

    fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
        let args = ArgList::new(self.family(), args);
        args.string(0, "ip")?;
        layout_from(&args)?;
        Ok(())
    }

    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let args = ArgList::new(DriverFamily::Wago, &args);
            let ip = args.string(0, "ip")?;
            let layout = layout_from(&args)?;
            let bank = Arc::new(WagoValveBank::new(&ip, layout));
            Ok(DeviceComponents::new(bank.clone()).with_valves(bank))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::valves()
    }
}

// =============================================================================
// WagoValveBank
// =============================================================================

/// Valve bank behind one WAGO coupler.
pub struct WagoValveBank {
    family: DriverFamily,
    connector: Box<dyn CoilConnector>,
    layout: CoilLayout,
    channels: ChannelMap,
    link: Link<DynCoilBus>,
    cell: SnapshotCell,
}

impl WagoValveBank {
    pub fn new(ip: &str, layout: CoilLayout) -> Self {
        Self::with_connector(DriverFamily::Wago, ModbusTcpConnector::new(ip), layout)
    }

    pub fn with_connector(
        family: DriverFamily,
        connector: impl CoilConnector + 'static,
        layout: CoilLayout,
    ) -> Self {
        Self {
            family,
            connector: Box::new(connector),
            channels: ChannelMap::single(layout.valve_num),
            layout,
            link: Link::new(family),
            cell: SnapshotCell::new(),
        }
    }

    pub fn layout(&self) -> CoilLayout {
        self.layout
    }

    /// Read every valve and publish the result.
    async fn read_block(&self) -> RigResult<Vec<bool>> {
        let states = {
            let mut bus = self.link.lock().await?;
            bus.read_coils(self.layout.read_base, self.layout.valve_num)
                .await
                .map_err(|e| {
                    RigError::command(
                        self.family,
                        format!("read {} coils at {}: {e}", self.layout.valve_num, self.layout.read_base),
                    )
                })?
        };
        if states.len() != usize::from(self.layout.valve_num) {
            return Err(RigError::command(
                self.family,
                format!(
                    "expected {} coils, coupler returned {}",
                    self.layout.valve_num,
                    states.len()
                ),
            ));
        }
        self.cell.publish(DeviceState::Valves(states.clone()));
        Ok(states)
    }

    async fn write_one(&self, channel: u16, state: bool) -> RigResult<()> {
        let address = self
            .layout
            .write_address(channel)
            .ok_or(RigError::ChannelOutOfRange {
                channel,
                total: self.layout.valve_num,
            })?;
        let mut bus = self.link.lock().await?;
        tracing::debug!(device = %self.family, channel, address, state, "write coil");
        bus.write_coil(address, state).await.map_err(|e| {
            RigError::command(self.family, format!("write coil {address}: {e}"))
        })
    }

    /// Write `state` to every targeted channel, collecting failures.
    async fn write_channels(&self, channels: &[u16], state: bool) -> RigResult<()> {
        let mut failed = Vec::new();
        for &channel in channels {
            match self.write_one(channel, state).await {
                Ok(()) => {}
                Err(RigError::NotConnected(family)) => return Err(RigError::NotConnected(family)),
                Err(e) => {
                    tracing::warn!(device = %self.family, channel, error = %e, "valve write failed");
                    failed.push(channel);
                }
            }
        }
        match (failed.is_empty(), channels) {
            (true, _) => Ok(()),
            // A lone channel keeps its own error rather than a one-item list
            (false, [channel]) => Err(RigError::command(
                self.family,
                format!("write to valve {channel} failed"),
            )),
            (false, _) => Err(RigError::PartialWrite {
                family: self.family,
                failed,
            }),
        }
    }

    fn select(&self, states: Vec<bool>, target: ChannelTarget) -> RigResult<ValveReadback> {
        match target {
            ChannelTarget::All => Ok(ValveReadback::All(states)),
            ChannelTarget::One(channel) => {
                self.channels.check(channel)?;
                Ok(ValveReadback::Single(states[usize::from(channel - 1)]))
            }
        }
    }
}

#[async_trait]
impl Driver for WagoValveBank {
    fn family(&self) -> DriverFamily {
        self.family
    }

    #[instrument(skip(self), fields(device = %self.family, address = %self.connector.describe()), err)]
    async fn connect(&self) -> RigResult<Unit> {
        self.link.ensure_detached()?;
        let bus = self
            .connector
            .open()
            .await
            .map_err(|e| RigError::connection(self.family, e.to_string()))?;
        self.link.attach(bus).await?;

        let init = async {
            self.read_block().await?;
            let all: Vec<u16> = self.channels.channels().collect();
            self.write_channels(&all, false).await?;
            self.read_block().await
        };
        match init.await {
            Ok(states) => {
                tracing::info!(valves = states.len(), "WAGO valve bank connected, all valves closed");
                Ok(Unit::OpenClosed)
            }
            Err(e) => {
                self.close().await;
                Err(RigError::connection(self.family, e.to_string()))
            }
        }
    }

    async fn close(&self) {
        if let Some(mut bus) = self.link.detach().await {
            if let Err(e) = bus.disconnect().await {
                tracing::warn!(device = %self.family, error = %e, "error while disconnecting");
            }
            tracing::info!(device = %self.family, "WAGO connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    #[instrument(skip(self), fields(device = %self.family), err)]
    async fn read_state(&self) -> RigResult<Snapshot> {
        self.read_block().await?;
        Ok(self.cell.latest())
    }

    async fn apply(&self, target: ChannelTarget, setpoint: Setpoint) -> RigResult<()> {
        match setpoint {
            Setpoint::Valve(state) => {
                let channels = self.channels.expand(target)?;
                self.write_channels(&channels, state).await
            }
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
        Unit::OpenClosed
    }

    fn set_unit(&self, unit: Unit) -> RigResult<()> {
        if unit == Unit::OpenClosed {
            Ok(())
        } else {
            Err(unit.incompatible(self.family))
        }
    }
}

#[async_trait]
impl ValveControl for WagoValveBank {
    fn valve_num(&self) -> u16 {
        self.layout.valve_num
    }

    #[instrument(skip(self), fields(device = %self.family, %target), err)]
    async fn valve_set(&self, state: bool, target: ChannelTarget) -> RigResult<ValveReadback> {
        let channels = self.channels.expand(target)?;
        self.write_channels(&channels, state).await?;
        let states = self.read_block().await?;
        self.select(states, target)
    }

    async fn valve_read(&self, target: ChannelTarget) -> RigResult<ValveReadback> {
        self.channels.expand(target)?;
        let states = self.read_block().await?;
        self.select(states, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[toml::Value]) -> Vec<toml::Value> {
        values.to_vec()
    }

    #[test]
    fn write_addresses_start_at_base() {
        let layout = CoilLayout::new(8, 512).with_write_base(16);
        assert_eq!(layout.write_address(1), Some(16));
        assert_eq!(layout.write_address(8), Some(23));
        assert_eq!(layout.write_address(0), None);
    }

    #[test]
    fn layouts_past_the_coil_space_are_rejected() {
        let ip = toml::Value::String("192.168.1.3".into());
        let high_write = args(&[
            ip.clone(),
            toml::Value::Integer(8),
            toml::Value::Integer(512),
            toml::Value::Integer(65530),
        ]);
        assert!(matches!(
            WagoFactory.validate(&high_write),
            Err(RigError::InvalidArguments { ref message, .. }) if message.contains("write_base")
        ));

        let high_read = args(&[ip.clone(), toml::Value::Integer(8), toml::Value::Integer(65530)]);
        assert!(matches!(
            WagoFactory.validate(&high_read),
            Err(RigError::InvalidArguments { ref message, .. }) if message.contains("reg_addr")
        ));

        // The last valve may sit exactly on coil 65535
        let edge = args(&[
            ip,
            toml::Value::Integer(8),
            toml::Value::Integer(65528),
            toml::Value::Integer(65528),
        ]);
        assert!(WagoFactory.validate(&edge).is_ok());
        assert_eq!(
            CoilLayout::new(8, 0).with_write_base(65528).write_address(8),
            Some(65535)
        );
    }

    #[test]
    fn factory_parses_positional_arguments() {
        let list = args(&[
            toml::Value::String("192.168.1.3".into()),
            toml::Value::Integer(8),
            toml::Value::String("512".into()),
        ]);
        let layout = layout_from(&ArgList::new(DriverFamily::Wago, &list)).unwrap();
        assert_eq!(layout, CoilLayout::new(8, 512));
        assert!(WagoFactory.validate(&list).is_ok());
    }

    #[test]
    fn factory_rejects_bad_arguments() {
        let zero = args(&[
            toml::Value::String("192.168.1.3".into()),
            toml::Value::Integer(0),
            toml::Value::Integer(0),
        ]);
        assert!(matches!(
            WagoFactory.validate(&zero),
            Err(RigError::InvalidArguments { .. })
        ));
        let short = args(&[toml::Value::String("192.168.1.3".into())]);
        assert!(WagoFactory.validate(&short).is_err());
    }
}
