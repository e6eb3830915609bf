//! Hardware and chip configuration files.

use mfc_hardware::config::{load_hardware, save_hardware, ConfigLoadError, Role};
use mfc_hardware::{ChipConfig, ChipEntry, HardwareConfig, SubsystemConfig};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const DIRECT: &str = r#"
[valving]
hardware = "wago"
config = ["192.168.1.3", 24, 512]

[flowing]
hardware = "mfcs-ez"
config = ["1001", "1002"]

[collecting]
hardware = "asi"
config = "COM4"
poll_interval_ms = 250
"#;

const PROFILES: &str = r#"
profile = "bench"

[profiles.bench.valving]
hardware = "mock_valve"

[profiles.lab.collecting]
hardware = "galil"
config = ["192.168.0.40"]
"#;

fn write(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, text).unwrap();
    path
}

#[test]
fn direct_toml_file() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "hardware.toml", DIRECT);

    let config = load_hardware(&path, None).unwrap();
    let valving = config.subsystem(Role::Valving).unwrap();
    assert_eq!(valving.hardware, "wago");
    assert_eq!(valving.config.len(), 3);
    assert_eq!(valving.config[1], toml::Value::Integer(24));

    let collecting = config.subsystem(Role::Collecting).unwrap();
    assert_eq!(collecting.config, vec![toml::Value::String("COM4".into())]);
    assert_eq!(collecting.poll_interval(), Some(Duration::from_millis(250)));
    assert_eq!(config.flowing.unwrap().poll_interval(), None);
}

#[test]
fn json_file_with_the_same_shape() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "hardware.json",
        r#"{"flowing": {"hardware": "mock_flow", "config": ["1001"]}}"#,
    );

    let config = load_hardware(&path, None).unwrap();
    assert_eq!(config.flowing.unwrap().hardware, "mock_flow");
    assert!(config.valving.is_none());
}

#[test]
fn profile_key_and_argument() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "hardware.toml", PROFILES);

    let bench = load_hardware(&path, None).unwrap();
    assert_eq!(bench.valving.unwrap().hardware, "mock_valve");
    assert!(bench.collecting.is_none());

    let lab = load_hardware(&path, Some("lab")).unwrap();
    assert_eq!(lab.collecting.unwrap().hardware, "galil");
    assert!(lab.valving.is_none());
}

#[test]
fn unknown_profile_lists_the_available_ones() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "hardware.toml", PROFILES);

    let err = load_hardware(&path, Some("attic")).unwrap_err();
    match err.downcast_ref::<ConfigLoadError>() {
        Some(ConfigLoadError::UnknownProfile { name, available }) => {
            assert_eq!(name, "attic");
            assert_eq!(available, "bench, lab");
        }
        other => panic!("expected UnknownProfile, got {other:?}"),
    }
}

#[test]
fn missing_and_unsupported_files() {
    let dir = TempDir::new().unwrap();
    let err = load_hardware(&dir.path().join("absent.toml"), None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigLoadError>(),
        Some(ConfigLoadError::NotFound(_))
    ));

    let path = write(&dir, "hardware.yaml", "valving: {}");
    let err = load_hardware(&path, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigLoadError>(),
        Some(ConfigLoadError::UnsupportedFormat(_))
    ));
}

#[test]
fn saved_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let config = HardwareConfig::default()
        .with_subsystem(
            Role::Valving,
            SubsystemConfig::new(
                "wago",
                vec![
                    toml::Value::String("10.0.0.2".into()),
                    toml::Value::Integer(16),
                    toml::Value::Integer(0),
                ],
            ),
        )
        .with_subsystem(Role::Collecting, SubsystemConfig::new("mock_stage", vec![]));

    for name in ["saved.toml", "saved.json"] {
        let path = dir.path().join(name);
        save_hardware(&path, &config).unwrap();
        assert_eq!(load_hardware(&path, None).unwrap(), config, "{name}");
    }
}

#[test]
fn chip_config_preserves_unknown_fields() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "chipConfig.json",
        r#"{"valves": {"1": {"name": "Inlet", "position": [0.5, 0.25], "note": "keep"}},
            "flows": {}, "image": "chip.png"}"#,
    );

    let mut chip = ChipConfig::load(&path).unwrap();
    chip.rename_valve(1, "Sample").unwrap();
    chip.flows.insert("1".into(), ChipEntry::named("Oil"));
    chip.save(&path).unwrap();

    let reloaded = ChipConfig::load(Path::new(&path)).unwrap();
    assert_eq!(reloaded.valve_name(1), Some("Sample"));
    assert_eq!(reloaded.valves["1"].position, Some([0.5, 0.25]));
    assert_eq!(reloaded.valves["1"].extra["note"], "keep");
    assert_eq!(reloaded.flow_name(1), Some("Oil"));
    assert_eq!(reloaded.extra["image"], "chip.png");
}
