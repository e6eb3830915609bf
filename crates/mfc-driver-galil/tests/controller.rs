//! Galil driver against the simulated DMC controller.

use mfc_core::busy::BusyPolicy;
use mfc_core::capabilities::{Driver, StageControl};
use mfc_core::driver::DriverFamily;
use mfc_core::error::RigError;
use mfc_core::snapshot::Position;
use mfc_core::units::Unit;
use mfc_driver_galil::{GalilController, X_COUNTS_PER_MM, Y_COUNTS_PER_MM};
use mfc_driver_mock::SimulatedGalil;
use std::time::Duration;

fn driver_for(sim: &SimulatedGalil) -> GalilController {
    let fast = BusyPolicy::new(Duration::from_millis(2), Duration::from_millis(500));
    GalilController::with_connector(DriverFamily::MockGalil, sim.connector())
        .with_policies(fast, fast)
}

fn close_to(a: Position, b: Position) -> bool {
    (a.x - b.x).abs() < 1e-3 && (a.y - b.y).abs() < 1e-3
}

#[tokio::test]
async fn connect_disables_echo_and_configures_limits() {
    let sim = SimulatedGalil::new();
    sim.set_counts(2012, 804);
    let galil = driver_for(&sim);

    assert_eq!(galil.connect().await.unwrap(), Unit::Millimeter);
    assert!(!sim.echo_enabled());
    assert_eq!(sim.limit_config().as_deref(), Some("1,1"));

    let position = galil.snapshot().state.position().unwrap();
    assert!(close_to(position, Position::new(1.0, 804.0 / Y_COUNTS_PER_MM)));
    galil.close().await;
}

#[tokio::test]
async fn absolute_move_scales_each_axis_and_waits_for_motion() {
    let sim = SimulatedGalil::new().with_motion_polls(3);
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    let position = galil.move_abs(1.0, 1.0).await.unwrap();
    assert_eq!(sim.counts(), (2012, 402));
    assert!(close_to(
        position,
        Position::new(2012.0 / X_COUNTS_PER_MM, 402.0 / Y_COUNTS_PER_MM)
    ));

    let log = sim.commands();
    let begin = log.iter().position(|c| c == "BG X,Y").unwrap();
    let motion_checks = log[begin..]
        .iter()
        .filter(|c| c.starts_with("MG "))
        .count();
    assert_eq!(motion_checks, 4);
    galil.close().await;
}

#[tokio::test]
async fn commands_refused_while_running_are_retried() {
    let sim = SimulatedGalil::new().with_motion_polls(0);
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    sim.start_running(3);
    galil.move_rel(2.0, -1.0).await.unwrap();
    assert_eq!(sim.counts(), (4024, -402));

    let refused = sim.commands().iter().filter(|c| *c == "TC1").count();
    assert!(refused >= 1, "no busy rejection was seen");
    galil.close().await;
}

#[tokio::test]
async fn controller_that_never_stops_times_out() {
    let sim = SimulatedGalil::new().with_motion_polls(u32::MAX);
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    let err = galil.move_abs(1.0, 0.0).await.unwrap_err();
    assert!(matches!(err, RigError::BusyTimeout { .. }), "got {err:?}");

    // Stop is still accepted and ends the move
    galil.stop().await.unwrap();
    assert_eq!(sim.commands().last().map(String::as_str), Some("ST"));
    galil.close().await;
}

#[tokio::test]
async fn homing_runs_axis_a_then_axis_b() {
    let sim = SimulatedGalil::new().with_motion_polls(1);
    sim.set_counts(5000, 7000);
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    let position = galil.homing().await.unwrap();
    assert!(close_to(position, Position::ORIGIN));

    let log = sim.commands();
    let a = log.iter().position(|c| c == "BGA").unwrap();
    let b = log.iter().position(|c| c == "BGB").unwrap();
    assert!(log.iter().position(|c| c == "HM").unwrap() < a);
    assert!(a < b);
    galil.close().await;
}

#[tokio::test]
async fn set_home_defines_current_position_as_origin() {
    let sim = SimulatedGalil::new();
    sim.set_counts(300, 300);
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    galil.set_home().await.unwrap();
    assert_eq!(sim.counts(), (0, 0));
    assert_eq!(galil.snapshot().state.position(), Some(Position::ORIGIN));
    galil.close().await;
}

#[tokio::test]
async fn speed_has_a_floor_of_one_millimetre_per_second() {
    let sim = SimulatedGalil::new();
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    galil.set_speed(0.2, 3.0).await.unwrap();
    assert_eq!(sim.speed_counts(), (2012, 1207));

    let (x, y) = galil.speed().await.unwrap();
    assert!((x - 1.0).abs() < 1e-3);
    assert!((y - 3.0).abs() < 1e-2);
    galil.close().await;
}

#[tokio::test]
async fn nan_speed_is_rejected_before_sending() {
    let sim = SimulatedGalil::new();
    let galil = driver_for(&sim);
    galil.connect().await.unwrap();

    // NaN speeds never reach the wire
    assert!(galil.set_speed(f64::NAN, 1.0).await.is_err());
    assert!(!sim.commands().iter().any(|c| c.starts_with("SP ") && c != "SP ?,?"));
    galil.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let sim = SimulatedGalil::new();
    let galil = driver_for(&sim);
    galil.close().await;

    galil.connect().await.unwrap();
    galil.close().await;
    galil.close().await;
    assert!(!galil.is_connected());
    assert!(matches!(
        galil.position().await,
        Err(RigError::NotConnected(DriverFamily::MockGalil))
    ));
}
