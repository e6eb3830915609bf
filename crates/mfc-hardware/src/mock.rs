//! Factories for the simulated families.
//!
//! Each build gets its own simulated device, wired to the real driver
//! through a simulated transport, so a rig configured with `mock_*` families
//! runs the same protocol code as one with hardware attached.

use futures::future::BoxFuture;
use mfc_core::driver::{ArgList, Capability, DeviceComponents, DriverFactory, DriverFamily};
use mfc_core::error::{RigError, RigResult};
use mfc_core::poller::PollerConfig;
use mfc_driver_asi::AsiStage;
use mfc_driver_fluigent::{MfcsEzFactory, SimulatedMfcs};
use mfc_driver_galil::GalilController;
use mfc_driver_mock::{SimulatedAsiStage, SimulatedCoilBank, SimulatedGalil};
use mfc_driver_wago::coupler::CoilLayout;
use mfc_driver_wago::WagoValveBank;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_VALVES: u16 = 8;
/// Process image offset used by the simulated coupler.
const MOCK_READ_BASE: u16 = 512;
const DEFAULT_SERIAL: &str = "1001";

pub fn register_all(registry: &mut crate::registry::DriverRegistry) {
    registry.register_factory(Box::new(MockValveFactory));
    registry.register_factory(Box::new(MockFlowFactory));
    registry.register_factory(Box::new(MockStageFactory));
    registry.register_factory(Box::new(MockGalilFactory));
}

// =============================================================================
// mock_valve
// =============================================================================

/// `[valve_num?]`, default 8.
pub struct MockValveFactory;

fn valve_count(args: &[toml::Value]) -> RigResult<u16> {
    let list = ArgList::new(DriverFamily::MockValve, args);
    // Accept the WAGO argument shape too, so a config can switch families
    // by changing only the name
    let index = usize::from(list.len() >= 2);
    let valves = match list.optional_integer(index, "valve_num")? {
        Some(n) => u16::try_from(n).ok().filter(|n| *n > 0).ok_or_else(|| {
            RigError::invalid_arguments(
                DriverFamily::MockValve,
                format!("valve_num {n} is out of range"),
            )
        })?,
        None => DEFAULT_VALVES,
    };
    CoilLayout::new(valves, MOCK_READ_BASE).check(DriverFamily::MockValve)?;
    Ok(valves)
}

impl DriverFactory for MockValveFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::MockValve
    }

    fn name(&self) -> &'static str {
        "Simulated Valve Bank"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Valves]
    }

    fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
        valve_count(args).map(|_| ())
    }

    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let valves = valve_count(&args)?;
            let bank = SimulatedCoilBank::new(valves).with_read_offset(MOCK_READ_BASE);
            let driver = Arc::new(WagoValveBank::with_connector(
                DriverFamily::MockValve,
                bank.connector(),
                CoilLayout::new(valves, MOCK_READ_BASE),
            ));
            Ok(DeviceComponents::new(driver.clone()).with_valves(driver))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::valves()
    }
}

// =============================================================================
// mock_flow
// =============================================================================

/// Controller serials, default one controller.
pub struct MockFlowFactory;

fn flow_args(args: Vec<toml::Value>) -> Vec<toml::Value> {
    if args.is_empty() {
        vec![toml::Value::String(DEFAULT_SERIAL.to_string())]
    } else {
        args
    }
}

fn flow_factory(serials: &[u16]) -> MfcsEzFactory {
    let library = SimulatedMfcs::with_controllers(serials);
    MfcsEzFactory::new(DriverFamily::MockFlow, Arc::new(library)).with_settle_delay(Duration::ZERO)
}

impl DriverFactory for MockFlowFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::MockFlow
    }

    fn name(&self) -> &'static str {
        "Simulated MFCS-EZ"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Pressure]
    }

    fn validate(&self, args: &[toml::Value]) -> RigResult<()> {
        flow_factory(&[]).validate(&flow_args(args.to_vec()))
    }

    fn build(&self, args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let args = flow_args(args);
            let serials = ArgList::new(DriverFamily::MockFlow, &args)
                .strings_from(0, "serial")?
                .iter()
                .filter_map(|s| s.parse::<u16>().ok())
                .collect::<Vec<_>>();
            flow_factory(&serials).build(args).await
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::pressure()
    }
}

// =============================================================================
// mock_stage / mock_galil
// =============================================================================

/// No arguments; any given are ignored.
pub struct MockStageFactory;

impl DriverFactory for MockStageFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::MockStage
    }

    fn name(&self) -> &'static str {
        "Simulated ASI MS-2000"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Stage]
    }

    fn validate(&self, _args: &[toml::Value]) -> RigResult<()> {
        Ok(())
    }

    fn build(&self, _args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let sim = SimulatedAsiStage::new();
            let stage = Arc::new(AsiStage::with_connector(
                DriverFamily::MockStage,
                sim.connector(),
            ));
            Ok(DeviceComponents::new(stage.clone()).with_stage(stage))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::stage()
    }
}

/// No arguments; any given are ignored.
pub struct MockGalilFactory;

impl DriverFactory for MockGalilFactory {
    fn family(&self) -> DriverFamily {
        DriverFamily::MockGalil
    }

    fn name(&self) -> &'static str {
        "Simulated Galil DMC"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Stage]
    }

    fn validate(&self, _args: &[toml::Value]) -> RigResult<()> {
        Ok(())
    }

    fn build(&self, _args: Vec<toml::Value>) -> BoxFuture<'static, RigResult<DeviceComponents>> {
        Box::pin(async move {
            let sim = SimulatedGalil::new();
            let controller = Arc::new(GalilController::with_connector(
                DriverFamily::MockGalil,
                sim.connector(),
            ));
            Ok(DeviceComponents::new(controller.clone()).with_stage(controller))
        })
    }

    fn default_poll(&self) -> PollerConfig {
        PollerConfig::stage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfc_core::channel::ChannelTarget;

    #[test]
    fn valve_count_accepts_both_argument_shapes() {
        assert_eq!(valve_count(&[]).unwrap(), DEFAULT_VALVES);
        assert_eq!(valve_count(&[toml::Value::Integer(4)]).unwrap(), 4);
        let wago_shape = [
            toml::Value::String("192.168.1.3".into()),
            toml::Value::Integer(16),
            toml::Value::Integer(512),
        ];
        assert_eq!(valve_count(&wago_shape).unwrap(), 16);
        assert!(valve_count(&[toml::Value::Integer(0)]).is_err());
        assert!(valve_count(&[toml::Value::Integer(65_535)]).is_err());
    }

    #[tokio::test]
    async fn mock_valve_runs_the_wago_driver() {
        let components = MockValveFactory
            .build(vec![toml::Value::Integer(4)])
            .await
            .unwrap();
        components.driver.connect().await.unwrap();
        let valves = components.valves.clone().unwrap();
        assert_eq!(valves.valve_num(), 4);
        assert!(valves
            .valve_set(true, ChannelTarget::One(2))
            .await
            .unwrap()
            .matches(true));
        components.driver.close().await;
    }

    #[tokio::test]
    async fn mock_flow_defaults_to_one_controller() {
        let components = MockFlowFactory.build(Vec::new()).await.unwrap();
        components.driver.connect().await.unwrap();
        assert_eq!(components.pressure.as_ref().unwrap().channel_num(), 4);
        components.driver.close().await;
    }
}
