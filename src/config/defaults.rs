use super::*;

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologyMode::Series,
            units: Vec::new(),
            poll_interval_ms: 1000,
            link: LinkConfig::default(),
            watchdog: WatchdogConfig::default(),
            limits: LimitsConfig::default(),
            imbalance: ImbalanceConfig::default(),
            cell_monitor: CellMonitorConfig::default(),
            alarms: AlarmConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: 5000,
            read_wait_ms: 250,
            connect_timeout_seconds: 15,
            max_consecutive_frame_errors: 5,
            reconnect_attempts: Some(10),
            backoff_initial_ms: 1000,
            backoff_max_ms: 60_000,
            stale_after_seconds: 15,
            capacity_ah: None,
            invert_current: false,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            action: WatchdogAction::Log,
            check_interval_ms: 1000,
        }
    }
}

impl AxisConfig {
    fn enabled(table: &[(f64, f64)]) -> Self {
        Self {
            enabled: true,
            table: table.to_vec(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            mode: LimitationMode::Linear,
            max_charge_current: 50.0,
            max_discharge_current: 60.0,
            min_cell_voltage: 2.9,
            max_cell_voltage: 3.45,
            float_cell_voltage: 3.35,
            max_voltage_time_seconds: 900,
            soc_reset_threshold: 90.0,
            charge_voltage_control: true,
            cell_voltage_charge: AxisConfig::enabled(&[
                (3.55, 0.0),
                (3.50, 0.05),
                (3.45, 0.5),
                (3.30, 1.0),
            ]),
            cell_voltage_discharge: AxisConfig::enabled(&[
                (2.70, 0.0),
                (2.80, 0.1),
                (2.90, 0.5),
                (3.10, 1.0),
            ]),
            temperature_charge: AxisConfig::enabled(&[
                (0.0, 0.0),
                (2.0, 0.1),
                (5.0, 0.2),
                (10.0, 0.4),
                (15.0, 0.8),
                (20.0, 1.0),
                (35.0, 1.0),
                (40.0, 0.4),
                (55.0, 0.0),
            ]),
            temperature_discharge: AxisConfig::enabled(&[
                (-20.0, 0.0),
                (0.0, 0.2),
                (5.0, 0.3),
                (10.0, 0.4),
                (15.0, 1.0),
                (45.0, 1.0),
                (55.0, 0.0),
            ]),
            soc_charge: AxisConfig::enabled(&[(85.0, 1.0), (91.0, 0.5), (95.0, 0.3), (98.0, 0.1)]),
            soc_discharge: AxisConfig::enabled(&[(10.0, 0.1), (20.0, 0.3), (30.0, 0.5), (35.0, 1.0)]),
            penalty_cell_voltages: vec![3.45, 3.55, 3.6],
            penalty_battery_voltages: vec![0.01, 1.0, 2.0],
        }
    }
}

impl Default for ImbalanceConfig {
    fn default() -> Self {
        Self {
            voltage_threshold: 0.3,
            current_deviation: 0.2,
            current_min_amps: 5.0,
            soc_detection_enabled: true,
            soc_threshold: 10.0,
            rebalancing_charge_fraction: 0.7,
            voltage_reduction_per_cell: 0.05,
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            soc_low_warning: 20.0,
            soc_low_alarm: 10.0,
        }
    }
}

impl Default for CellMonitorConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 0.2,
            max_alerts: 100,
            sample_interval_seconds: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/data/log/btbattery/btbattery.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}
