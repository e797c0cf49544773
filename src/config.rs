//! Configuration management for btbattery
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. The raw [`Config`] mirrors the file; the
//! core only ever sees [`Settings`], produced once by [`Config::resolve`] with
//! every breakpoint table validated and every per-unit override merged.

use crate::error::{BtBatteryError, Result};
use crate::limits::LimitationMode;
use crate::model::TopologyMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;
mod resolve;

pub use resolve::{LinkSettings, Settings, UnitSettings, WatchdogSettings};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How the physical units are wired together
    pub topology: TopologyMode,

    /// Physical units, in bus order
    pub units: Vec<UnitConfig>,

    /// Aggregation and publish cadence in milliseconds
    pub poll_interval_ms: u64,

    /// Link session behaviour shared by all units
    pub link: LinkConfig,

    /// Process-wide liveness watchdog
    pub watchdog: WatchdogConfig,

    /// Charge/discharge limitation tables
    pub limits: LimitsConfig,

    /// Cross-unit imbalance detection
    pub imbalance: ImbalanceConfig,

    /// Cell statistics, alerts and history samples
    pub cell_monitor: CellMonitorConfig,

    /// Software alarm levels
    pub alarms: AlarmConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// One physical BMS unit
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnitConfig {
    /// Bluetooth address, e.g. `70:3E:97:08:00:62`
    pub address: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Values replacing the global ones for this unit only
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub overrides: Option<UnitOverride>,
}

/// Per-unit override of global settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UnitOverride {
    pub max_charge_current: Option<f64>,
    pub max_discharge_current: Option<f64>,
    pub min_cell_voltage: Option<f64>,
    pub max_cell_voltage: Option<f64>,
    pub float_cell_voltage: Option<f64>,
    /// Capacity to assume when the BMS reports none (Ah)
    pub capacity_ah: Option<f64>,
    pub invert_current: Option<bool>,
}

/// Link session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How often each unit is asked for fresh data
    pub request_interval_ms: u64,

    /// Longest wait for a notification per poll
    pub read_wait_ms: u64,

    /// Connection establishment timeout
    pub connect_timeout_seconds: u64,

    /// Consecutive bad frames before forcing a reconnect
    pub max_consecutive_frame_errors: u32,

    /// Reconnect attempts before giving up; `null` retries forever
    pub reconnect_attempts: Option<u32>,

    /// First reconnect delay
    pub backoff_initial_ms: u64,

    /// Reconnect delay cap
    pub backoff_max_ms: u64,

    /// Data older than this marks a unit stale
    pub stale_after_seconds: u64,

    /// Capacity to assume when the BMS reports none (Ah)
    pub capacity_ah: Option<f64>,

    /// Flip the sign of reported current
    pub invert_current: bool,
}

/// Action taken when the watchdog expires
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogAction {
    /// Log the expiry and re-arm
    #[default]
    Log,
    /// Stop the process so the supervisor restarts it
    Restart,
}

/// Watchdog parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds without any valid frame before expiry; 0 disables
    pub timeout_seconds: u64,

    pub action: WatchdogAction,

    /// Monitor check cadence
    pub check_interval_ms: u64,
}

/// One limiting axis: a breakpoint table that can be switched off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `[threshold, fraction]` pairs, ascending or descending
    pub table: Vec<(f64, f64)>,
}

fn default_true() -> bool {
    true
}

/// Limitation calculator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// `linear` interpolation or `step` lookup
    pub mode: LimitationMode,

    /// Max charge current per unit (A)
    pub max_charge_current: f64,

    /// Max discharge current per unit (A)
    pub max_discharge_current: f64,

    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub float_cell_voltage: f64,

    /// Seconds at max cell voltage before switching to float; 0 disables
    pub max_voltage_time_seconds: u64,

    /// SOC (%) below which the float hold is released
    pub soc_reset_threshold: f64,

    /// Apply the cell-voltage penalty to the charge voltage
    pub charge_voltage_control: bool,

    pub cell_voltage_charge: AxisConfig,
    pub cell_voltage_discharge: AxisConfig,
    pub temperature_charge: AxisConfig,
    pub temperature_discharge: AxisConfig,
    pub soc_charge: AxisConfig,
    pub soc_discharge: AxisConfig,

    /// Cell voltages at which a penalty starts
    pub penalty_cell_voltages: Vec<f64>,

    /// Battery-voltage subtraction per over-threshold cell, index-aligned
    pub penalty_battery_voltages: Vec<f64>,
}

/// Imbalance detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImbalanceConfig {
    /// Unit voltage spread that flags an imbalance (V)
    pub voltage_threshold: f64,

    /// Allowed relative deviation from the equal current share
    pub current_deviation: f64,

    /// Expected share below which current imbalance is not evaluated (A)
    pub current_min_amps: f64,

    pub soc_detection_enabled: bool,

    /// SOC spread that flags an imbalance (percentage points)
    pub soc_threshold: f64,

    /// Charge fraction ceiling while any imbalance is active
    pub rebalancing_charge_fraction: f64,

    /// Charge voltage reduction per cell on voltage or SOC imbalance (V)
    pub voltage_reduction_per_cell: f64,
}

/// Cell monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CellMonitorConfig {
    /// Per-unit cell spread that raises an alert (V)
    pub alert_threshold: f64,

    /// Alerts retained in memory
    pub max_alerts: usize,

    /// Seconds between history samples; 0 samples every cycle
    pub sample_interval_seconds: u64,
}

/// Software alarm thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlarmConfig {
    /// SOC below which `LowSoc` raises a warning (%)
    pub soc_low_warning: f64,

    /// SOC below which `LowSoc` raises an alarm (%)
    pub soc_low_alarm: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console level override
    pub console_level: Option<String>,

    /// Optional file level override
    pub file_level: Option<String>,

    /// Path to log file (its directory receives daily rotated files)
    pub file: String,

    /// Number of backup files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations, or fall back to defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "btbattery_config.yaml",
            "/data/btbattery_config.yaml",
            "/etc/btbattery/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration, including every breakpoint table
    pub fn validate(&self) -> Result<()> {
        self.resolve().map(|_| ())
    }

    /// Validate scalar fields that do not need table construction
    fn validate_scalars(&self) -> Result<()> {
        if self.units.is_empty() {
            return Err(BtBatteryError::validation(
                "units",
                "At least one unit must be configured",
            ));
        }
        for (i, unit) in self.units.iter().enumerate() {
            if unit.address.trim().is_empty() {
                return Err(BtBatteryError::validation(
                    format!("units[{i}].address"),
                    "Address cannot be empty",
                ));
            }
            let duplicate = self.units[..i]
                .iter()
                .any(|u| u.address.eq_ignore_ascii_case(&unit.address));
            if duplicate {
                return Err(BtBatteryError::validation(
                    format!("units[{i}].address"),
                    format!("Address {} listed twice", unit.address),
                ));
            }
        }

        if self.poll_interval_ms == 0 {
            return Err(BtBatteryError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }
        if self.link.request_interval_ms == 0 {
            return Err(BtBatteryError::validation(
                "link.request_interval_ms",
                "Must be greater than 0",
            ));
        }
        if self.link.max_consecutive_frame_errors == 0 {
            return Err(BtBatteryError::validation(
                "link.max_consecutive_frame_errors",
                "Must be greater than 0",
            ));
        }
        if self.link.backoff_initial_ms == 0 || self.link.backoff_max_ms < self.link.backoff_initial_ms {
            return Err(BtBatteryError::validation(
                "link.backoff_max_ms",
                "Backoff must be positive and max must not be below initial",
            ));
        }
        if self.link.stale_after_seconds == 0 {
            return Err(BtBatteryError::validation(
                "link.stale_after_seconds",
                "Must be greater than 0",
            ));
        }
        if self.watchdog.timeout_seconds > 0 && self.watchdog.check_interval_ms == 0 {
            return Err(BtBatteryError::validation(
                "watchdog.check_interval_ms",
                "Must be greater than 0 when the watchdog is enabled",
            ));
        }

        let im = &self.imbalance;
        if im.voltage_threshold <= 0.0 {
            return Err(BtBatteryError::validation(
                "imbalance.voltage_threshold",
                "Must be positive",
            ));
        }
        if im.current_deviation <= 0.0 {
            return Err(BtBatteryError::validation(
                "imbalance.current_deviation",
                "Must be positive",
            ));
        }
        if im.soc_threshold <= 0.0 {
            return Err(BtBatteryError::validation(
                "imbalance.soc_threshold",
                "Must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&im.rebalancing_charge_fraction) {
            return Err(BtBatteryError::validation(
                "imbalance.rebalancing_charge_fraction",
                "Must be within [0, 1]",
            ));
        }
        if im.voltage_reduction_per_cell < 0.0 {
            return Err(BtBatteryError::validation(
                "imbalance.voltage_reduction_per_cell",
                "Must not be negative",
            ));
        }
        let alarms = &self.alarms;
        if !(0.0..=100.0).contains(&alarms.soc_low_warning)
            || !(0.0..=100.0).contains(&alarms.soc_low_alarm)
        {
            return Err(BtBatteryError::validation(
                "alarms",
                "SOC alarm levels must be within [0, 100]",
            ));
        }
        if alarms.soc_low_alarm > alarms.soc_low_warning {
            return Err(BtBatteryError::validation(
                "alarms.soc_low_alarm",
                "Must not be above soc_low_warning",
            ));
        }
        if self.cell_monitor.alert_threshold <= 0.0 {
            return Err(BtBatteryError::validation(
                "cell_monitor.alert_threshold",
                "Must be positive",
            ));
        }
        Ok(())
    }
}
