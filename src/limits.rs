//! Limitation calculator
//!
//! Maps one unit's telemetry onto allowed charge/discharge current fractions
//! and a charge-voltage penalty using piecewise-linear breakpoint tables.
//! Every table goes through the same [`BreakpointTable::interpolate`]
//! primitive; only the query value differs per axis.
//!
//! The only carried state is the max-voltage hold timer kept by
//! [`LimitationCalculator`]; [`evaluate_tables`] itself is pure.

use crate::error::{BtBatteryError, Result};
use crate::model::{LimitDecision, LimitReason, UnitState};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// One (threshold, value) pair of a breakpoint table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub threshold: f64,
    pub value: f64,
}

/// Validated breakpoint table with strictly ascending thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointTable {
    points: Vec<Breakpoint>,
}

impl BreakpointTable {
    /// Build a table from `(threshold, value)` pairs.
    ///
    /// Pairs may be listed in strictly ascending or strictly descending
    /// threshold order; descending tables are reversed. Anything else,
    /// an empty table or non-finite numbers are rejected with a validation
    /// error naming `field`.
    pub fn new(field: &str, pairs: &[(f64, f64)]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(BtBatteryError::validation(
                field,
                "table needs at least one breakpoint",
            ));
        }
        if pairs.iter().any(|(t, v)| !t.is_finite() || !v.is_finite()) {
            return Err(BtBatteryError::validation(
                field,
                "thresholds and values must be finite numbers",
            ));
        }

        let ascending = pairs.windows(2).all(|w| w[0].0 < w[1].0);
        let descending = pairs.windows(2).all(|w| w[0].0 > w[1].0);
        if !ascending && !descending {
            return Err(BtBatteryError::validation(
                field,
                "thresholds must be strictly increasing or strictly decreasing",
            ));
        }

        let mut points: Vec<Breakpoint> = pairs
            .iter()
            .map(|&(threshold, value)| Breakpoint { threshold, value })
            .collect();
        if !ascending {
            points.reverse();
        }
        Ok(Self { points })
    }

    /// Build a table from two parallel columns
    pub fn from_columns(field: &str, thresholds: &[f64], values: &[f64]) -> Result<Self> {
        if thresholds.len() != values.len() {
            return Err(BtBatteryError::validation(
                field,
                format!(
                    "{} thresholds but {} values",
                    thresholds.len(),
                    values.len()
                ),
            ));
        }
        let pairs: Vec<(f64, f64)> = thresholds
            .iter()
            .copied()
            .zip(values.iter().copied())
            .collect();
        Self::new(field, &pairs)
    }

    /// Reject values outside `[lo, hi]`
    pub fn check_values(self, field: &str, lo: f64, hi: f64) -> Result<Self> {
        if let Some(bad) = self.points.iter().find(|p| p.value < lo || p.value > hi) {
            return Err(BtBatteryError::validation(
                field,
                format!("value {} outside [{}, {}]", bad.value, lo, hi),
            ));
        }
        Ok(self)
    }

    pub fn points(&self) -> &[Breakpoint] {
        &self.points
    }

    /// Lowest threshold of the table
    pub fn lowest_threshold(&self) -> f64 {
        self.points.first().map_or(f64::INFINITY, |p| p.threshold)
    }

    /// Smallest value in the table
    pub fn most_restrictive(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.value)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Clamp below the first and above the last breakpoint, interpolate
    /// linearly in between.
    pub fn interpolate(&self, v: f64) -> f64 {
        self.lookup(v, |lo, hi| {
            lo.value + (hi.value - lo.value) * (v - lo.threshold) / (hi.threshold - lo.threshold)
        })
    }

    /// Like [`interpolate`](Self::interpolate) but returns the smaller value
    /// of the bracketing pair instead of a blend.
    pub fn step(&self, v: f64) -> f64 {
        self.lookup(v, |lo, hi| lo.value.min(hi.value))
    }

    fn lookup(&self, v: f64, between: impl Fn(Breakpoint, Breakpoint) -> f64) -> f64 {
        if v.is_nan() {
            return self.most_restrictive();
        }
        match self.points.as_slice() {
            [] => self.most_restrictive(),
            [only] => only.value,
            [first, .., last] => {
                if v <= first.threshold {
                    first.value
                } else if v >= last.threshold {
                    last.value
                } else {
                    // first index whose threshold is above v; 1..len by the clamps above
                    let idx = self.points.partition_point(|p| p.threshold <= v);
                    between(self.points[idx - 1], self.points[idx])
                }
            }
        }
    }
}

/// How fraction tables are evaluated between breakpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimitationMode {
    #[default]
    Linear,
    Step,
}

/// Resolved limit settings for one unit
#[derive(Debug, Clone, PartialEq)]
pub struct LimitSettings {
    pub mode: LimitationMode,
    /// Amps
    pub max_charge_current: f64,
    /// Amps
    pub max_discharge_current: f64,
    pub min_cell_voltage: f64,
    pub max_cell_voltage: f64,
    pub float_cell_voltage: f64,
    /// Time at or above `max_cell_voltage` before the hold engages; zero disables
    pub max_voltage_time: Duration,
    /// SOC (%) under which the hold releases
    pub soc_reset_threshold: f64,
    pub charge_voltage_control: bool,
    /// `None` means the axis is disabled
    pub cell_voltage_charge: Option<BreakpointTable>,
    pub cell_voltage_discharge: Option<BreakpointTable>,
    pub temperature_charge: Option<BreakpointTable>,
    pub temperature_discharge: Option<BreakpointTable>,
    pub soc_charge: Option<BreakpointTable>,
    pub soc_discharge: Option<BreakpointTable>,
    /// Cell voltage → battery-voltage subtraction
    pub penalty: BreakpointTable,
}

impl LimitSettings {
    fn lookup(&self, table: &BreakpointTable, v: f64) -> f64 {
        match self.mode {
            LimitationMode::Linear => table.interpolate(v),
            LimitationMode::Step => table.step(v),
        }
    }

    /// Fraction of one axis; disabled axes and missing readings give 1.0.
    /// Several readings (e.g. temperature sensors) keep the most restrictive.
    fn axis(&self, table: Option<&BreakpointTable>, readings: &[f64]) -> f64 {
        let Some(table) = table else {
            return 1.0;
        };
        readings
            .iter()
            .map(|&v| self.lookup(table, v))
            .reduce(f64::min)
            .map_or(1.0, |f| f.clamp(0.0, 1.0))
    }
}

/// Sum of penalties for every cell at or above the table's first threshold
pub fn voltage_penalty(table: &BreakpointTable, cells: &[f64]) -> f64 {
    let start = table.lowest_threshold();
    cells
        .iter()
        .filter(|&&v| v >= start)
        .map(|&v| table.interpolate(v).max(0.0))
        .sum()
}

/// Evaluate every table for `unit` without touching the hold timer
pub fn evaluate_tables(settings: &LimitSettings, unit: &UnitState) -> LimitDecision {
    let max_cell: Vec<f64> = unit.max_cell_voltage().into_iter().collect();
    let min_cell: Vec<f64> = unit.min_cell_voltage().into_iter().collect();
    let soc = [unit.soc];

    let cv_charge = settings.axis(settings.cell_voltage_charge.as_ref(), &max_cell);
    let cv_discharge = settings.axis(settings.cell_voltage_discharge.as_ref(), &min_cell);
    let t_charge = settings.axis(settings.temperature_charge.as_ref(), &unit.temperatures);
    let t_discharge = settings.axis(settings.temperature_discharge.as_ref(), &unit.temperatures);
    let soc_charge = settings.axis(settings.soc_charge.as_ref(), &soc);
    let soc_discharge = settings.axis(settings.soc_discharge.as_ref(), &soc);

    let mut decision = LimitDecision::unrestricted();
    decision.charge_current_fraction = cv_charge.min(t_charge).min(soc_charge);
    decision.discharge_current_fraction = cv_discharge.min(t_discharge).min(soc_discharge);

    if cv_charge < 1.0 || cv_discharge < 1.0 {
        decision.reasons.insert(LimitReason::CellVoltage);
    }
    if t_charge < 1.0 || t_discharge < 1.0 {
        decision.reasons.insert(LimitReason::Temperature);
    }
    if soc_charge < 1.0 || soc_discharge < 1.0 {
        decision.reasons.insert(LimitReason::Soc);
    }

    if settings.charge_voltage_control {
        decision.charge_voltage_penalty = voltage_penalty(&settings.penalty, &unit.cell_voltages);
        if decision.charge_voltage_penalty > 0.0 {
            decision.reasons.insert(LimitReason::CellVoltage);
        }
    }
    decision
}

/// Max-voltage hold timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaxVoltageHold {
    since: Option<Instant>,
    engaged: bool,
}

impl MaxVoltageHold {
    /// Advance the timer with this cycle's readings; returns whether the
    /// hold is engaged.
    pub fn update(
        &mut self,
        max_cell: Option<f64>,
        soc: f64,
        settings: &LimitSettings,
        now: Instant,
    ) -> bool {
        if settings.max_voltage_time.is_zero() || soc < settings.soc_reset_threshold {
            *self = Self::default();
            return false;
        }

        if max_cell.is_some_and(|v| v >= settings.max_cell_voltage) {
            let since = *self.since.get_or_insert(now);
            if now.saturating_duration_since(since) > settings.max_voltage_time {
                self.engaged = true;
            }
        } else {
            self.since = None;
        }
        self.engaged
    }

    pub const fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// When the voltage first reached the ceiling in the current run
    pub const fn since(&self) -> Option<Instant> {
        self.since
    }
}

/// Per-unit calculator: the pure table evaluation plus the hold timer
#[derive(Debug, Clone)]
pub struct LimitationCalculator {
    settings: LimitSettings,
    hold: MaxVoltageHold,
}

impl LimitationCalculator {
    pub fn new(settings: LimitSettings) -> Self {
        Self {
            settings,
            hold: MaxVoltageHold::default(),
        }
    }

    pub const fn settings(&self) -> &LimitSettings {
        &self.settings
    }

    pub const fn hold(&self) -> &MaxVoltageHold {
        &self.hold
    }

    pub fn evaluate(&mut self, unit: &UnitState, now: Instant) -> LimitDecision {
        let held = self
            .hold
            .update(unit.max_cell_voltage(), unit.soc, &self.settings, now);

        let mut decision = evaluate_tables(&self.settings, unit);
        if held {
            decision.hold_active = true;
            decision.charge_current_fraction = 0.0;
            decision.reasons.insert(LimitReason::TimeHold);
        }
        decision.charge_current_limit =
            decision.charge_current_fraction * self.settings.max_charge_current;
        decision.discharge_current_limit =
            decision.discharge_current_fraction * self.settings.max_discharge_current;
        decision
    }

    /// Charge voltage target for `cell_count` cells after penalty and hold
    pub fn charge_voltage_target(&self, decision: &LimitDecision, cell_count: usize) -> f64 {
        charge_voltage_target(&self.settings, decision, cell_count)
    }
}

/// `(float if held else max) × cells − penalty`, never negative
pub fn charge_voltage_target(
    settings: &LimitSettings,
    decision: &LimitDecision,
    cell_count: usize,
) -> f64 {
    let per_cell = if decision.hold_active {
        settings.float_cell_voltage
    } else {
        settings.max_cell_voltage
    };
    #[allow(clippy::cast_precision_loss)]
    let nominal = per_cell * cell_count as f64;
    (nominal - decision.charge_voltage_penalty).max(0.0)
}
