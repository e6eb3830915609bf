//! ASI driver against the simulated MS-2000.

use mfc_core::busy::BusyPolicy;
use mfc_core::capabilities::{Driver, Setpoint, StageControl};
use mfc_core::channel::ChannelTarget;
use mfc_core::driver::DriverFamily;
use mfc_core::error::RigError;
use mfc_core::snapshot::Position;
use mfc_core::units::Unit;
use mfc_driver_asi::AsiStage;
use mfc_driver_mock::SimulatedAsiStage;
use std::time::Duration;
use tracing_test::traced_test;

fn fast_policies() -> (BusyPolicy, BusyPolicy) {
    (
        BusyPolicy::new(Duration::from_millis(2), Duration::from_millis(500)),
        BusyPolicy::new(Duration::from_millis(2), Duration::from_millis(500)),
    )
}

fn driver_for(sim: &SimulatedAsiStage) -> AsiStage {
    let (status, settle) = fast_policies();
    AsiStage::with_connector(DriverFamily::MockStage, sim.connector()).with_policies(status, settle)
}

fn close_to(a: Position, b: Position) -> bool {
    (a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9
}

#[tokio::test]
async fn connect_enables_motors_and_reads_position() {
    let sim = SimulatedAsiStage::new();
    sim.set_counts(12_000.0, 3_000.0);
    let stage = driver_for(&sim);

    assert_eq!(stage.connect().await.unwrap(), Unit::Millimeter);
    assert!(stage.is_connected());
    assert!(sim.commands().iter().any(|c| c == "2H MC X+ Y+"));
    assert_eq!(
        stage.snapshot().state.position(),
        Some(Position::new(1.2, 0.3))
    );
    stage.close().await;
}

#[tokio::test]
async fn absolute_move_waits_for_motion_then_refreshes() {
    let sim = SimulatedAsiStage::new().with_busy_polls_after_move(3);
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    let position = stage.move_abs(1.5, -0.5).await.unwrap();
    assert!(close_to(position, Position::new(1.5, -0.5)));
    assert_eq!(sim.counts(), (15_000.0, -5_000.0));

    // Position was only read after STATUS reported idle
    let log = sim.commands();
    let moved = log.iter().position(|c| c.starts_with("2H M ")).unwrap();
    let read = log.iter().rposition(|c| c == "2H W X").unwrap();
    let busy_checks = log[moved..read].iter().filter(|c| *c == "2H STATUS").count();
    assert!(busy_checks >= 4, "only {busy_checks} status checks after the move");
    stage.close().await;
}

#[tokio::test]
async fn relative_move_and_home() {
    let sim = SimulatedAsiStage::new().with_busy_polls_after_move(0);
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    stage.move_rel(0.1, 0.2).await.unwrap();
    let position = stage.move_rel(0.1, 0.2).await.unwrap();
    assert!(close_to(position, Position::new(0.2, 0.4)));

    let home = stage.home().await.unwrap();
    assert!(close_to(home, Position::ORIGIN));
    assert!(sim.commands().iter().any(|c| c == "2H M X=0.0 Y=0.0"));
    stage.close().await;
}

#[tokio::test]
#[traced_test]
async fn always_busy_stage_times_out() {
    let sim = SimulatedAsiStage::new();
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    sim.set_always_busy(true);
    let started = tokio::time::Instant::now();
    let err = stage.move_abs(1.0, 1.0).await.unwrap_err();
    assert!(matches!(err, RigError::BusyTimeout { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(logs_contain("gave up waiting for device"));
    stage.close().await;
}

#[tokio::test]
async fn halt_skips_the_busy_wait() {
    let sim = SimulatedAsiStage::new();
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    sim.set_always_busy(true);
    stage.stop().await.unwrap();
    assert_eq!(sim.commands().last().map(String::as_str), Some("2H HALT"));
    stage.close().await;
}

#[tokio::test]
async fn speed_is_clamped_to_controller_maximum() {
    let sim = SimulatedAsiStage::new();
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    stage.set_speed(20.0, 2.0).await.unwrap();
    assert!(sim.commands().iter().any(|c| c == "2H S X=8.6 Y=2.0"));
    let (x, y) = stage.speed().await.unwrap();
    assert!((x - 8.6).abs() < 1e-9);
    assert!((y - 2.0).abs() < 1e-9);

    assert!(matches!(
        stage.set_speed(-1.0, 1.0).await,
        Err(RigError::OutOfRange { .. })
    ));
    stage.close().await;
}

#[tokio::test]
async fn apply_dispatches_moves_and_rejects_other_setpoints() {
    let sim = SimulatedAsiStage::new().with_busy_polls_after_move(0);
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    stage
        .apply(ChannelTarget::All, Setpoint::MoveAbs { x: 2.0, y: 1.0 })
        .await
        .unwrap();
    assert_eq!(sim.counts(), (20_000.0, 10_000.0));

    let err = stage
        .apply(ChannelTarget::All, Setpoint::Valve(true))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::UnsupportedSetpoint { .. }));
    stage.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_safe_before_connect() {
    let sim = SimulatedAsiStage::new();
    let stage = driver_for(&sim);

    stage.close().await;
    assert!(!stage.is_connected());

    stage.connect().await.unwrap();
    stage.close().await;
    stage.close().await;
    assert!(!stage.is_connected());
    assert!(matches!(
        stage.read_state().await,
        Err(RigError::NotConnected(DriverFamily::MockStage))
    ));
}

#[tokio::test]
async fn second_connect_fails_fast() {
    let sim = SimulatedAsiStage::new();
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();

    assert_eq!(
        stage.connect().await,
        Err(RigError::AlreadyConnected(DriverFamily::MockStage))
    );
    stage.close().await;
}

#[tokio::test]
async fn unplugged_port_leaves_driver_disconnected() {
    let sim = SimulatedAsiStage::new();
    let connector = sim.connector();
    connector.refuse_connections(true);
    let (status, settle) = fast_policies();
    let stage =
        AsiStage::with_connector(DriverFamily::MockStage, connector).with_policies(status, settle);

    let err = stage.connect().await.unwrap_err();
    assert!(matches!(err, RigError::Connection { .. }));
    assert!(!stage.is_connected());
    stage.close().await;
}

#[tokio::test]
async fn reconnect_after_close() {
    let sim = SimulatedAsiStage::new();
    let stage = driver_for(&sim);
    stage.connect().await.unwrap();
    stage.close().await;

    stage.connect().await.unwrap();
    assert!(stage.position().await.is_ok());
    stage.close().await;
}
