//! Validated runtime settings.
//!
//! Per-unit overrides are merged into the global values exactly once here.
//! Nothing downstream looks at [`UnitOverride`] again.

use super::*;
use crate::limits::{BreakpointTable, LimitSettings};
use crate::model::UnitId;
use std::time::Duration;

/// Immutable configuration handed to the core
#[derive(Debug, Clone)]
pub struct Settings {
    pub topology: TopologyMode,
    pub poll_interval: Duration,
    pub link: LinkSettings,
    pub watchdog: WatchdogSettings,
    pub imbalance: ImbalanceConfig,
    pub cell_monitor: CellMonitorConfig,
    pub alarms: AlarmConfig,
    pub units: Vec<UnitSettings>,
}

/// Link session timing and budgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub request_interval: Duration,
    pub read_wait: Duration,
    pub connect_timeout: Duration,
    pub max_consecutive_frame_errors: u32,
    /// `None` retries forever
    pub reconnect_attempts: Option<u32>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub stale_after: Duration,
}

impl LinkSettings {
    /// Delay before reconnect attempt `attempt` (0-based): doubles each
    /// time, capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Whether `attempts` failed reconnects use up the budget
    pub fn budget_exhausted(&self, attempts: u32) -> bool {
        self.reconnect_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Watchdog timing and action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Zero disables the watchdog
    pub timeout: Duration,
    pub action: WatchdogAction,
    pub check_interval: Duration,
}

impl WatchdogSettings {
    pub const fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }
}

/// Fully merged settings of one unit
#[derive(Debug, Clone)]
pub struct UnitSettings {
    pub id: UnitId,
    pub address: String,
    pub name: Option<String>,
    pub limits: LimitSettings,
    /// Capacity to assume when the BMS reports zero (Ah)
    pub capacity_ah: Option<f64>,
    pub invert_current: bool,
}

impl UnitSettings {
    /// Name if configured, otherwise the address
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl Config {
    /// Validate everything and merge per-unit overrides.
    ///
    /// This is the only place configuration errors are produced; a
    /// successful result is safe to run with.
    pub fn resolve(&self) -> Result<Settings> {
        self.validate_scalars()?;

        let base = self.base_limits()?;
        let units = self
            .units
            .iter()
            .enumerate()
            .map(|(index, unit)| self.resolve_unit(index, unit, &base))
            .collect::<Result<Vec<_>>>()?;

        Ok(Settings {
            topology: self.topology,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            link: LinkSettings {
                request_interval: Duration::from_millis(self.link.request_interval_ms),
                read_wait: Duration::from_millis(self.link.read_wait_ms),
                connect_timeout: Duration::from_secs(self.link.connect_timeout_seconds),
                max_consecutive_frame_errors: self.link.max_consecutive_frame_errors,
                reconnect_attempts: self.link.reconnect_attempts,
                backoff_initial: Duration::from_millis(self.link.backoff_initial_ms),
                backoff_max: Duration::from_millis(self.link.backoff_max_ms),
                stale_after: Duration::from_secs(self.link.stale_after_seconds),
            },
            watchdog: WatchdogSettings {
                timeout: Duration::from_secs(self.watchdog.timeout_seconds),
                action: self.watchdog.action,
                check_interval: Duration::from_millis(self.watchdog.check_interval_ms),
            },
            imbalance: self.imbalance.clone(),
            cell_monitor: self.cell_monitor.clone(),
            alarms: self.alarms.clone(),
            units,
        })
    }

    fn base_limits(&self) -> Result<LimitSettings> {
        let l = &self.limits;
        let limits = LimitSettings {
            mode: l.mode,
            max_charge_current: l.max_charge_current,
            max_discharge_current: l.max_discharge_current,
            min_cell_voltage: l.min_cell_voltage,
            max_cell_voltage: l.max_cell_voltage,
            float_cell_voltage: l.float_cell_voltage,
            max_voltage_time: Duration::from_secs(l.max_voltage_time_seconds),
            soc_reset_threshold: l.soc_reset_threshold,
            charge_voltage_control: l.charge_voltage_control,
            cell_voltage_charge: fraction_axis("limits.cell_voltage_charge", &l.cell_voltage_charge)?,
            cell_voltage_discharge: fraction_axis(
                "limits.cell_voltage_discharge",
                &l.cell_voltage_discharge,
            )?,
            temperature_charge: fraction_axis("limits.temperature_charge", &l.temperature_charge)?,
            temperature_discharge: fraction_axis(
                "limits.temperature_discharge",
                &l.temperature_discharge,
            )?,
            soc_charge: fraction_axis("limits.soc_charge", &l.soc_charge)?,
            soc_discharge: fraction_axis("limits.soc_discharge", &l.soc_discharge)?,
            penalty: BreakpointTable::from_columns(
                "limits.penalty",
                &l.penalty_cell_voltages,
                &l.penalty_battery_voltages,
            )?
            .check_values("limits.penalty", 0.0, f64::INFINITY)?,
        };
        check_limit_scalars("limits", &limits)?;
        Ok(limits)
    }

    fn resolve_unit(
        &self,
        index: usize,
        unit: &UnitConfig,
        base: &LimitSettings,
    ) -> Result<UnitSettings> {
        let mut limits = base.clone();
        let mut capacity_ah = self.link.capacity_ah;
        let mut invert_current = self.link.invert_current;

        if let Some(ov) = &unit.overrides {
            if let Some(v) = ov.max_charge_current {
                limits.max_charge_current = v;
            }
            if let Some(v) = ov.max_discharge_current {
                limits.max_discharge_current = v;
            }
            if let Some(v) = ov.min_cell_voltage {
                limits.min_cell_voltage = v;
            }
            if let Some(v) = ov.max_cell_voltage {
                limits.max_cell_voltage = v;
            }
            if let Some(v) = ov.float_cell_voltage {
                limits.float_cell_voltage = v;
            }
            if ov.capacity_ah.is_some() {
                capacity_ah = ov.capacity_ah;
            }
            if let Some(v) = ov.invert_current {
                invert_current = v;
            }
            check_limit_scalars(&format!("units[{index}].override"), &limits)?;
        }

        if let Some(cap) = capacity_ah
            && cap <= 0.0
        {
            return Err(BtBatteryError::validation(
                format!("units[{index}].capacity_ah"),
                "Must be positive",
            ));
        }

        Ok(UnitSettings {
            id: UnitId(index),
            address: unit.address.trim().to_uppercase(),
            name: unit.name.clone(),
            limits,
            capacity_ah,
            invert_current,
        })
    }
}

fn fraction_axis(field: &str, axis: &AxisConfig) -> Result<Option<BreakpointTable>> {
    if !axis.enabled {
        return Ok(None);
    }
    BreakpointTable::new(field, &axis.table)?
        .check_values(field, 0.0, 1.0)
        .map(Some)
}

fn check_limit_scalars(prefix: &str, l: &LimitSettings) -> Result<()> {
    if !(l.max_charge_current >= 0.0) {
        return Err(BtBatteryError::validation(
            format!("{prefix}.max_charge_current"),
            "Must not be negative",
        ));
    }
    if !(l.max_discharge_current >= 0.0) {
        return Err(BtBatteryError::validation(
            format!("{prefix}.max_discharge_current"),
            "Must not be negative",
        ));
    }
    if !(l.min_cell_voltage > 0.0
        && l.min_cell_voltage < l.float_cell_voltage
        && l.float_cell_voltage <= l.max_cell_voltage)
    {
        return Err(BtBatteryError::validation(
            format!("{prefix}.cell_voltages"),
            "Expected 0 < min_cell_voltage < float_cell_voltage <= max_cell_voltage",
        ));
    }
    if !(0.0..=100.0).contains(&l.soc_reset_threshold) {
        return Err(BtBatteryError::validation(
            format!("{prefix}.soc_reset_threshold"),
            "Must be within [0, 100]",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_units() -> Config {
        let mut config = Config::default();
        config.units = vec![
            UnitConfig {
                address: "aa:bb:cc:dd:ee:01".to_string(),
                ..UnitConfig::default()
            },
            UnitConfig {
                address: "AA:BB:CC:DD:EE:02".to_string(),
                name: Some("rear".to_string()),
                overrides: Some(UnitOverride {
                    max_charge_current: Some(20.0),
                    max_cell_voltage: Some(3.5),
                    invert_current: Some(true),
                    ..UnitOverride::default()
                }),
            },
        ];
        config
    }

    #[test]
    fn overrides_merge_into_one_unit_only() {
        let settings = two_units().resolve().unwrap();
        let (a, b) = (&settings.units[0], &settings.units[1]);
        assert_eq!(a.address, "AA:BB:CC:DD:EE:01");
        assert_eq!(a.label(), "AA:BB:CC:DD:EE:01");
        assert_eq!(b.label(), "rear");
        assert!((a.limits.max_charge_current - 50.0).abs() < 1e-12);
        assert!((b.limits.max_charge_current - 20.0).abs() < 1e-12);
        assert!((b.limits.max_cell_voltage - 3.5).abs() < 1e-12);
        assert!((b.limits.max_discharge_current - 60.0).abs() < 1e-12);
        assert!(!a.invert_current);
        assert!(b.invert_current);
        assert_eq!(b.id, UnitId(1));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut config = two_units();
        if let Some(ov) = config.units[1].overrides.as_mut() {
            ov.min_cell_voltage = Some(3.6);
        }
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("units[1].override"));
    }

    #[test]
    fn disabled_axis_resolves_to_none() {
        let mut config = two_units();
        config.limits.soc_charge.enabled = false;
        let settings = config.resolve().unwrap();
        assert!(settings.units[0].limits.soc_charge.is_none());
        assert!(settings.units[0].limits.cell_voltage_charge.is_some());
    }

    #[test]
    fn bad_tables_are_config_errors() {
        let mut config = two_units();
        config.limits.temperature_charge.table = vec![(0.0, 0.0), (10.0, 1.0), (5.0, 0.5)];
        let err = config.resolve().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("limits.temperature_charge"));

        let mut config = two_units();
        config.limits.soc_discharge.table = vec![(10.0, 1.5)];
        assert!(config.resolve().is_err());

        let mut config = two_units();
        config.limits.penalty_battery_voltages.pop();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = two_units().resolve().unwrap();
        let link = &settings.link;
        assert_eq!(link.backoff(0), Duration::from_secs(1));
        assert_eq!(link.backoff(1), Duration::from_secs(2));
        assert_eq!(link.backoff(3), Duration::from_secs(8));
        assert_eq!(link.backoff(10), Duration::from_secs(60));
        assert_eq!(link.backoff(40), Duration::from_secs(60));
        assert!(!link.budget_exhausted(9));
        assert!(link.budget_exhausted(10));
    }
}
