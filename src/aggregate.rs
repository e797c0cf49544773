//! Virtual battery aggregation
//!
//! Combines the live units of the current snapshot into one
//! [`VirtualBatteryState`] following the configured topology, and flags
//! cross-unit imbalance. Pure and synchronous: the only input is the
//! snapshot and the per-unit limit decisions of the same cycle.

use crate::cell_monitor::statistics;
use crate::config::{AlarmConfig, ImbalanceConfig, Settings, UnitSettings};
use crate::limits::charge_voltage_target;
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{
    AggregateLimits, AlarmLevel, ImbalanceEvent, ImbalanceFlags, ImbalanceKind,
    LimitDecision, TaggedCell, TopologyMode, UnitState, UnitView, VirtualBatteryState, cell_tag,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Comparisons against imbalance thresholds ignore differences this small
const EPSILON: f64 = 1e-6;

/// Output of one aggregation cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub state: VirtualBatteryState,
    /// Imbalances active this cycle
    pub events: Vec<ImbalanceEvent>,
}

pub struct Aggregator {
    topology: TopologyMode,
    imbalance: ImbalanceConfig,
    alarms: AlarmConfig,
    alert_threshold: f64,
    units: Vec<UnitSettings>,
    logger: StructuredLogger,
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn min_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.reduce(f64::min)
}

fn max_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.reduce(f64::max)
}

fn tagged(unit: &UnitState) -> impl Iterator<Item = TaggedCell> + '_ {
    unit.cell_voltages
        .iter()
        .enumerate()
        .map(move |(index, &voltage)| TaggedCell {
            tag: cell_tag(unit.id, index),
            unit: unit.id,
            index,
            voltage,
            balancing: unit.cell_balancing.get(index).copied().unwrap_or(false),
        })
}

impl Aggregator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            topology: settings.topology,
            imbalance: settings.imbalance.clone(),
            alarms: settings.alarms.clone(),
            alert_threshold: settings.cell_monitor.alert_threshold,
            units: settings.units.clone(),
            logger: get_logger("aggregate"),
        }
    }

    fn soc_level(&self, soc: f64) -> AlarmLevel {
        if soc < self.alarms.soc_low_alarm {
            AlarmLevel::Alarm
        } else if soc < self.alarms.soc_low_warning {
            AlarmLevel::Warning
        } else {
            AlarmLevel::Ok
        }
    }

    /// Aggregate one snapshot.
    ///
    /// `units` must already reflect staleness as observed this cycle;
    /// `decisions` is index-aligned with `units` and holds a decision for
    /// every live unit.
    pub fn aggregate(&self, units: &[UnitState], decisions: &[Option<LimitDecision>]) -> Aggregation {
        let views = units
            .iter()
            .enumerate()
            .map(|(i, u)| UnitView {
                id: u.id,
                address: u.address.clone(),
                status: u.status,
                voltage: u.voltage,
                current: u.current,
                soc: u.soc,
                capacity_total: u.capacity_total,
                cell_count: u.cell_count(),
                consecutive_errors: u.consecutive_errors,
                decision: decisions.get(i).cloned().flatten(),
            })
            .collect();

        let live: Vec<(usize, &UnitState)> = units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_live())
            .collect();

        let timestamp = Utc::now();
        let mut state = VirtualBatteryState::offline(self.topology, units.len());
        state.timestamp = timestamp;
        state.units = views;
        state.active_unit_count = live.len();
        if live.is_empty() {
            return Aggregation {
                state,
                events: Vec::new(),
            };
        }

        let live_units: Vec<&UnitState> = live.iter().map(|(_, u)| *u).collect();
        self.electrical(&live_units, &mut state);

        state.temperature_max = max_of(live_units.iter().filter_map(|u| u.max_temperature()));
        state.temperature_min = min_of(live_units.iter().filter_map(|u| u.min_temperature()));
        state.protection = live_units
            .iter()
            .fold(state.protection, |p, u| p.union(u.protection));
        state.cell_stats = statistics(&live_units, self.alert_threshold);

        state.charge_cycles = live_units.iter().map(|u| u.cycles).max().unwrap_or(0);
        state.soc_low = live_units
            .iter()
            .map(|u| self.soc_level(u.soc))
            .max()
            .unwrap_or_default();

        let (flags, events) = self.detect_imbalance(&live_units, timestamp);
        state.imbalance = flags;
        let spread_alert = state.cell_stats.as_ref().is_some_and(|s| s.alert_count > 0);
        if spread_alert || flags.any() {
            state.cell_imbalance = AlarmLevel::Warning;
        }
        state.limits = self.limits(&live, decisions, flags);
        state.limits.allow_charge = state.charge_enabled && state.limits.charge_current_limit > 0.0;
        state.limits.allow_discharge =
            state.discharge_enabled && state.limits.discharge_current_limit > 0.0;

        Aggregation { state, events }
    }

    /// Voltage, current, capacity, SOC, cells and FET enables
    fn electrical(&self, live: &[&UnitState], state: &mut VirtualBatteryState) {
        match self.topology {
            TopologyMode::Series => {
                state.voltage = live.iter().map(|u| u.voltage).sum();
                state.current = mean(live.iter().map(|u| u.current)).unwrap_or(0.0);
                state.capacity = min_of(live.iter().map(|u| u.capacity_total)).unwrap_or(0.0);
                state.capacity_remaining =
                    min_of(live.iter().map(|u| u.capacity_remaining)).unwrap_or(0.0);
                state.soc = min_of(live.iter().map(|u| u.soc));
                state.cell_count = live.iter().map(|u| u.cell_count()).sum();
                state.cells = live.iter().flat_map(|u| tagged(u)).collect();
                state.charge_enabled = live.iter().all(|u| u.charge_enabled);
                state.discharge_enabled = live.iter().all(|u| u.discharge_enabled);
            }
            TopologyMode::Parallel => {
                state.voltage = mean(live.iter().map(|u| u.voltage)).unwrap_or(0.0);
                state.current = live.iter().map(|u| u.current).sum();
                state.capacity = live.iter().map(|u| u.capacity_total).sum();
                state.capacity_remaining = live.iter().map(|u| u.capacity_remaining).sum();
                state.soc = if state.capacity > 0.0 {
                    Some(live.iter().map(|u| u.soc * u.capacity_total).sum::<f64>() / state.capacity)
                } else {
                    mean(live.iter().map(|u| u.soc))
                };
                let first = live[0];
                if live.iter().any(|u| u.cell_count() != first.cell_count()) {
                    self.logger.warn(&format!(
                        "Parallel units disagree on cell count: {:?}",
                        live.iter().map(|u| u.cell_count()).collect::<Vec<_>>()
                    ));
                }
                state.cell_count = first.cell_count();
                state.cells = tagged(first).collect();
                state.charge_enabled = live.iter().any(|u| u.charge_enabled);
                state.discharge_enabled = live.iter().any(|u| u.discharge_enabled);
            }
        }
        state.power = state.voltage * state.current;
    }

    /// Voltage, current and SOC divergence across live units
    fn detect_imbalance(
        &self,
        live: &[&UnitState],
        timestamp: DateTime<Utc>,
    ) -> (ImbalanceFlags, Vec<ImbalanceEvent>) {
        let mut flags = ImbalanceFlags::default();
        let mut events = Vec::new();
        if live.len() < 2 {
            return (flags, events);
        }
        let cfg = &self.imbalance;
        let mut raise = |kind, magnitude: f64, threshold: f64| {
            events.push(ImbalanceEvent {
                kind,
                magnitude,
                threshold,
                timestamp,
            });
        };

        let spread = |values: &dyn Fn(&UnitState) -> f64| {
            let max = max_of(live.iter().map(|u| values(u))).unwrap_or(0.0);
            let min = min_of(live.iter().map(|u| values(u))).unwrap_or(0.0);
            max - min
        };

        let voltage_spread = spread(&|u: &UnitState| u.voltage);
        if voltage_spread > cfg.voltage_threshold + EPSILON {
            flags.voltage = true;
            raise(ImbalanceKind::Voltage, voltage_spread, cfg.voltage_threshold);
        }

        if let Some(share) = mean(live.iter().map(|u| u.current))
            && share.abs() >= cfg.current_min_amps
        {
            let deviation = live
                .iter()
                .map(|u| (u.current - share).abs() / share.abs())
                .fold(0.0, f64::max);
            if deviation > cfg.current_deviation + EPSILON {
                flags.current = true;
                raise(ImbalanceKind::Current, deviation, cfg.current_deviation);
            }
        }

        if cfg.soc_detection_enabled {
            let soc_spread = spread(&|u: &UnitState| u.soc);
            if soc_spread > cfg.soc_threshold + EPSILON {
                flags.soc = true;
                raise(ImbalanceKind::Soc, soc_spread, cfg.soc_threshold);
            }
        }

        (flags, events)
    }

    /// Combine per-unit decisions into the virtual battery's limits
    fn limits(
        &self,
        live: &[(usize, &UnitState)],
        decisions: &[Option<LimitDecision>],
        flags: ImbalanceFlags,
    ) -> AggregateLimits {
        let mut limits = AggregateLimits::blocked();
        limits.charge_fraction = 1.0;
        limits.discharge_fraction = 1.0;

        let mut nominal_charge = Vec::with_capacity(live.len());
        let mut nominal_discharge = Vec::with_capacity(live.len());
        let mut voltage_targets = Vec::with_capacity(live.len());
        let mut min_voltage = Vec::with_capacity(live.len());
        let mut reasons = BTreeSet::new();

        for &(i, unit) in live {
            let Some(settings) = self.units.get(i) else {
                continue;
            };
            let decision = decisions
                .get(i)
                .cloned()
                .flatten()
                .unwrap_or_else(LimitDecision::unrestricted);
            let cells = unit.cell_count();
            #[allow(clippy::cast_precision_loss)]
            let cells_f = cells as f64;

            limits.charge_fraction = limits.charge_fraction.min(decision.charge_current_fraction);
            limits.discharge_fraction = limits
                .discharge_fraction
                .min(decision.discharge_current_fraction);
            limits.hold_active |= decision.hold_active;
            reasons.extend(decision.reasons.iter().copied());

            nominal_charge.push(settings.limits.max_charge_current);
            nominal_discharge.push(settings.limits.max_discharge_current);
            voltage_targets.push((
                charge_voltage_target(&settings.limits, &decision, cells),
                cells_f,
                settings.limits.min_cell_voltage * cells_f,
            ));
            min_voltage.push(settings.limits.min_cell_voltage * cells_f);
        }

        if flags.any() {
            let derated = limits
                .charge_fraction
                .min(self.imbalance.rebalancing_charge_fraction);
            limits.imbalance_derated = derated < limits.charge_fraction;
            limits.charge_fraction = derated;
        }

        let combine = |values: &[f64]| match self.topology {
            TopologyMode::Series => min_of(values.iter().copied()).unwrap_or(0.0),
            TopologyMode::Parallel => values.iter().sum(),
        };
        let charge_nominal = combine(&nominal_charge);
        let discharge_nominal = combine(&nominal_discharge);
        limits.charge_current_limit = limits.charge_fraction * charge_nominal;
        limits.discharge_current_limit = limits.discharge_fraction * discharge_nominal;

        let (target, cells, floor) = match self.topology {
            TopologyMode::Series => voltage_targets
                .iter()
                .fold((0.0, 0.0, 0.0), |(t, c, f), &(ut, uc, uf)| (t + ut, c + uc, f + uf)),
            TopologyMode::Parallel => voltage_targets
                .iter()
                .copied()
                .reduce(|a, b| if b.0 < a.0 { b } else { a })
                .unwrap_or((0.0, 0.0, 0.0)),
        };
        limits.charge_voltage_limit = if flags.voltage || flags.soc {
            (target - self.imbalance.voltage_reduction_per_cell * cells).max(floor)
        } else {
            target
        };
        limits.discharge_voltage_limit = match self.topology {
            TopologyMode::Series => min_voltage.iter().sum(),
            TopologyMode::Parallel => max_of(min_voltage.iter().copied()).unwrap_or(0.0),
        };
        limits.reasons = reasons;
        limits
    }
}
