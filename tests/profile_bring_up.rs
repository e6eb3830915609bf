//! A profile file brought up through the library re-exports.

use microfluidic_control::{load_hardware, ChannelTarget, DriverRegistry, Rig, Role, SubsystemStatus};

#[tokio::test]
async fn bench_profile_runs_on_simulated_devices() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("hardware.toml");
    std::fs::write(
        &path,
        r#"
profile = "bench"

[profiles.bench.valving]
hardware = "mock_valve"
config = [12]

[profiles.bench.collecting]
hardware = "mock_galil"
"#,
    )
    .unwrap();

    let config = load_hardware(&path, None).unwrap();
    let mut rig = Rig::bring_up(&config, &DriverRegistry::with_defaults()).await;

    assert_eq!(rig.status(Role::Flowing), SubsystemStatus::NotConfigured);
    let valves = rig.valves().unwrap();
    assert_eq!(valves.valve_num(), 12);
    assert!(valves.valve_switch(12).await.unwrap());
    assert!(valves
        .valve_check(false, ChannelTarget::One(11))
        .await
        .unwrap());

    let stage = rig.stage().unwrap();
    let moved = stage.move_rel(2.0, 1.0).await.unwrap();
    assert!((moved.x - 2.0).abs() < 1e-3);

    rig.shutdown().await;
    assert!(rig.stage().is_none());
}
