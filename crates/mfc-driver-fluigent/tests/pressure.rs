//! MFCS-EZ driver against the simulated vendor library.

use mfc_core::capabilities::{Driver, PressureControl, Setpoint};
use mfc_core::channel::ChannelTarget;
use mfc_core::driver::{DriverFactory, DriverFamily};
use mfc_core::error::RigError;
use mfc_core::units::{PressureUnit, Unit, MBAR_TO_PSI};
use mfc_driver_fluigent::{MfcsEz, MfcsEzFactory, SimulatedMfcs, ALPHA};
use std::sync::Arc;
use std::time::Duration;

fn driver(sim: &SimulatedMfcs, serials: &[u16]) -> MfcsEz {
    MfcsEz::new(DriverFamily::MockFlow, Arc::new(sim.clone()), serials.to_vec())
        .with_settle_delay(Duration::ZERO)
}

#[tokio::test]
async fn connect_configures_every_controller() {
    let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
    let ez = driver(&sim, &[1001, 1002]);

    assert_eq!(
        ez.connect().await.unwrap(),
        Unit::Pressure(PressureUnit::Millibar)
    );
    assert_eq!(ez.channel_num(), 8);
    assert_eq!(sim.alpha(1001), Some(ALPHA));
    assert_eq!(sim.alpha(1002), Some(ALPHA));
    assert_eq!(ez.snapshot().state.pressure(), Some(&[0.0; 8][..]));
    ez.close().await;
    assert_eq!(sim.open_handles(), 0);
}

#[tokio::test]
async fn channels_route_to_the_right_controller() {
    let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
    let ez = driver(&sim, &[1001, 1002]);
    ez.connect().await.unwrap();

    ez.set_pressure(120.0, ChannelTarget::One(5), None)
        .await
        .unwrap();
    ez.set_pressure(80.0, ChannelTarget::One(4), None)
        .await
        .unwrap();
    assert_eq!(sim.pressure(1002, 1), Some(120.0));
    assert_eq!(sim.pressure(1001, 4), Some(80.0));

    let snapshot = ez.read_state().await.unwrap();
    assert_eq!(
        snapshot.state.pressure(),
        Some(&[0.0, 0.0, 0.0, 80.0, 120.0, 0.0, 0.0, 0.0][..])
    );
    ez.close().await;
}

#[tokio::test]
async fn display_units_convert_both_ways() {
    let sim = SimulatedMfcs::with_controllers(&[1001]);
    let ez = driver(&sim, &[1001]);
    ez.connect().await.unwrap();

    ez.set_unit(Unit::Pressure(PressureUnit::Psi)).unwrap();
    assert_eq!(ez.limit(), Some(15.0));
    assert!((ez.conversion_factor() - MBAR_TO_PSI).abs() < 1e-12);

    ez.set_pressure(1.0, ChannelTarget::One(1), None)
        .await
        .unwrap();
    let mbar = f64::from(sim.pressure(1001, 1).unwrap());
    assert!((mbar - 1.0 / MBAR_TO_PSI).abs() < 1e-2);

    let psi = ez
        .read_pressure(ChannelTarget::One(1), None)
        .await
        .unwrap();
    assert!((psi[0] - 1.0).abs() < 1e-4);

    let kpa = ez
        .read_pressure(ChannelTarget::One(1), Some(PressureUnit::Kilopascal))
        .await
        .unwrap();
    assert!((kpa[0] - mbar * 0.1).abs() < 1e-9);
    ez.close().await;
}

#[tokio::test]
async fn setpoints_above_the_unit_limit_are_rejected() {
    let sim = SimulatedMfcs::with_controllers(&[1001]);
    let ez = driver(&sim, &[1001]);
    ez.connect().await.unwrap();

    assert!(matches!(
        ez.set_pressure(1035.0, ChannelTarget::All, None).await,
        Err(RigError::OutOfRange { .. })
    ));
    assert!(matches!(
        ez.set_pressure(16.0, ChannelTarget::All, Some(PressureUnit::Psi))
            .await,
        Err(RigError::OutOfRange { .. })
    ));
    assert!(matches!(
        ez.set_pressure(-1.0, ChannelTarget::All, None).await,
        Err(RigError::OutOfRange { .. })
    ));
    assert_eq!(sim.pressure(1001, 1), Some(0.0));
    ez.close().await;
}

#[tokio::test]
async fn broadcast_write_reports_failing_channels() {
    let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
    let ez = driver(&sim, &[1001, 1002]);
    ez.connect().await.unwrap();
    sim.fail_channel(1002, 2);

    let err = ez
        .apply(ChannelTarget::All, Setpoint::Pressure(50.0))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RigError::PartialWrite {
            family: DriverFamily::MockFlow,
            failed: vec![6],
        }
    );
    assert_eq!(sim.pressure(1002, 3), Some(50.0));
    ez.close().await;
}

#[tokio::test]
async fn unprimed_controller_fails_connect_and_releases_handles() {
    let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
    sim.unprime(1002);
    let ez = driver(&sim, &[1001, 1002]);

    let err = ez.connect().await.unwrap_err();
    match err {
        RigError::Connection { message, .. } => {
            assert!(message.contains("1002"), "{message}");
            assert!(!message.contains("1001"), "{message}");
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
    assert!(!ez.is_connected());
    assert_eq!(sim.open_handles(), 0);
}

#[tokio::test]
async fn controller_answering_as_another_serial_fails_connect() {
    let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
    sim.misreport_serial(1002, 1003);
    let ez = driver(&sim, &[1001, 1002]);

    match ez.connect().await {
        Err(RigError::Connection { message, .. }) => {
            assert!(message.contains("1003"), "{message}");
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
    assert_eq!(sim.open_handles(), 0);
}

#[tokio::test]
async fn losing_concurrent_connect_closes_its_own_handles() {
    let sim = SimulatedMfcs::with_controllers(&[1001, 1002]);
    let ez = driver(&sim, &[1001, 1002]);

    let (first, second) = tokio::join!(ez.connect(), ez.connect());
    let (winner, loser) = if first.is_ok() {
        (first, second)
    } else {
        (second, first)
    };
    assert!(winner.is_ok());
    assert!(matches!(
        loser,
        Err(RigError::AlreadyConnected(DriverFamily::MockFlow))
    ));
    assert_eq!(sim.open_handles(), 2);
    assert_eq!(sim.closed(), 2);

    ez.read_state().await.unwrap();
    ez.close().await;
    assert_eq!(sim.open_handles(), 0);
}

#[tokio::test]
async fn missing_controller_is_a_connection_error() {
    let sim = SimulatedMfcs::with_controllers(&[1001]);
    let ez = driver(&sim, &[4040]);

    assert!(matches!(
        ez.connect().await,
        Err(RigError::Connection { .. })
    ));
    ez.close().await;
    assert!(!ez.is_connected());
}

#[tokio::test]
async fn close_twice_is_harmless() {
    let sim = SimulatedMfcs::with_controllers(&[1001]);
    let ez = driver(&sim, &[1001]);
    ez.connect().await.unwrap();

    ez.close().await;
    ez.close().await;
    assert_eq!(sim.closed(), 1);
    assert!(matches!(
        ez.read_state().await,
        Err(RigError::NotConnected(DriverFamily::MockFlow))
    ));
}

#[tokio::test]
async fn factory_builds_a_pressure_device() {
    let sim = SimulatedMfcs::with_controllers(&[1001]);
    let factory = MfcsEzFactory::new(DriverFamily::MockFlow, Arc::new(sim.clone()))
        .with_settle_delay(Duration::ZERO);

    let components = factory
        .build(vec![toml::Value::String("1001".into())])
        .await
        .unwrap();
    let pressure = components.pressure.clone().unwrap();
    components.driver.connect().await.unwrap();

    pressure
        .set_pressure(200.0, ChannelTarget::One(2), None)
        .await
        .unwrap();
    assert_eq!(sim.pressure(1001, 2), Some(200.0));
    components.driver.close().await;
}

#[tokio::test(start_paused = true)]
async fn controllers_get_a_settle_delay_before_status() {
    let sim = SimulatedMfcs::with_controllers(&[1001]);
    let ez = MfcsEz::new(DriverFamily::MockFlow, Arc::new(sim.clone()), vec![1001]);

    let started = tokio::time::Instant::now();
    ez.connect().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    ez.close().await;
}
