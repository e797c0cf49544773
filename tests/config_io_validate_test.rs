use btbattery::config::{Config, UnitConfig, UnitOverride};
use btbattery::model::TopologyMode;
use std::fs;

fn with_units(addresses: &[&str]) -> Config {
    let mut cfg = Config::default();
    cfg.units = addresses
        .iter()
        .map(|a| UnitConfig {
            address: (*a).to_string(),
            ..UnitConfig::default()
        })
        .collect();
    cfg
}

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = with_units(&["70:3E:97:08:00:62", "70:3E:97:08:00:63"]);
    cfg.topology = TopologyMode::Parallel;
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.topology, TopologyMode::Parallel);
    assert_eq!(loaded.units.len(), 2);
    assert_eq!(loaded.units[1].address, "70:3E:97:08:00:63");
    assert_eq!(loaded.logging.file, cfg.logging.file);
    assert!(loaded.validate().is_ok());
}

#[test]
fn minimal_yaml_fills_defaults() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        tmp.path(),
        b"topology: series\nunits:\n  - address: aa:bb:cc:dd:ee:01\n    override:\n      capacity_ah: 280\n",
    )
    .unwrap();
    let cfg = Config::from_file(tmp.path()).unwrap();
    let settings = cfg.resolve().unwrap();

    assert_eq!(settings.units.len(), 1);
    assert_eq!(settings.units[0].address, "AA:BB:CC:DD:EE:01");
    assert_eq!(settings.units[0].capacity_ah, Some(280.0));
    assert_eq!(settings.poll_interval.as_millis(), 1000);
    assert!((settings.alarms.soc_low_warning - 20.0).abs() < 1e-9);
}

#[test]
fn config_validation_errors() {
    // No units
    assert!(Config::default().validate().is_err());

    // Empty address
    let cfg = with_units(&[" "]);
    assert!(cfg.validate().is_err());

    // Same unit twice, case-insensitively
    let cfg = with_units(&["aa:bb", "AA:BB"]);
    assert!(cfg.validate().is_err());

    // Poll interval zero
    let mut cfg = with_units(&["aa:01"]);
    cfg.poll_interval_ms = 0;
    assert!(cfg.validate().is_err());

    // Rebalancing fraction outside [0, 1]
    let mut cfg = with_units(&["aa:01"]);
    cfg.imbalance.rebalancing_charge_fraction = 1.5;
    assert!(cfg.validate().is_err());

    // Backoff max below initial
    let mut cfg = with_units(&["aa:01"]);
    cfg.link.backoff_max_ms = cfg.link.backoff_initial_ms - 1;
    assert!(cfg.validate().is_err());

    // SOC alarm level above the warning level
    let mut cfg = with_units(&["aa:01"]);
    cfg.alarms.soc_low_alarm = 30.0;
    assert!(cfg.validate().is_err());

    // Float above max cell voltage through an override
    let mut cfg = with_units(&["aa:01"]);
    cfg.units[0].overrides = Some(UnitOverride {
        float_cell_voltage: Some(3.7),
        max_cell_voltage: Some(3.6),
        ..UnitOverride::default()
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn non_monotonic_table_is_rejected() {
    let mut cfg = with_units(&["aa:01"]);
    cfg.limits.temperature_charge.table = vec![(0.0, 0.0), (10.0, 1.0), (5.0, 0.5)];
    let err = cfg.validate().unwrap_err();
    assert!(err.is_config_error());
    assert!(format!("{err}").contains("limits.temperature_charge"));
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}
