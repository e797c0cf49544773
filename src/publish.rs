//! Publisher seam
//!
//! A publisher receives every cycle's [`VirtualBatteryState`] together with
//! the observed unit list. [`attribute_map`] flattens both into the
//! Venus-style path → value map a bus adapter exposes; [`LogPublisher`]
//! writes that map to the log for headless runs.

use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{UnitState, VirtualBatteryState};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Consumer of aggregate state
#[async_trait::async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, state: &VirtualBatteryState, units: &[UnitState]) -> Result<()>;
}

fn flag(on: bool) -> Value {
    json!(u8::from(on))
}

/// Venus alarm levels: 0 ok, 2 alarm
fn alarm(on: bool) -> Value {
    json!(if on { 2 } else { 0 })
}

fn opt(value: Option<f64>) -> Value {
    value.map_or(Value::Null, |v| json!(v))
}

/// Every published attribute keyed by its bus path
pub fn attribute_map(state: &VirtualBatteryState, units: &[UnitState]) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    let mut put = |path: String, value: Value| {
        map.insert(path, value);
    };
    let online = state.is_online();

    put("/Connected".into(), flag(online));
    put("/Dc/0/Voltage".into(), json!(state.voltage));
    put("/Dc/0/Current".into(), json!(state.current));
    put("/Dc/0/Power".into(), json!(state.power));
    put("/Dc/0/Temperature".into(), opt(state.temperature_max));
    put("/Soc".into(), opt(state.soc));
    put("/InstalledCapacity".into(), json!(state.capacity));
    put("/Capacity".into(), json!(state.capacity_remaining));
    put(
        "/ConsumedAmphours".into(),
        json!((state.capacity - state.capacity_remaining).max(0.0)),
    );

    let limits = &state.limits;
    put("/Info/MaxChargeVoltage".into(), json!(limits.charge_voltage_limit));
    put("/Info/BatteryLowVoltage".into(), json!(limits.discharge_voltage_limit));
    put("/Info/MaxChargeCurrent".into(), json!(limits.charge_current_limit));
    put("/Info/MaxDischargeCurrent".into(), json!(limits.discharge_current_limit));
    put("/Io/AllowToCharge".into(), flag(limits.allow_charge));
    put("/Io/AllowToDischarge".into(), flag(limits.allow_discharge));

    let p = state.protection;
    put("/Alarms/HighCellVoltage".into(), alarm(p.cell_overvoltage()));
    put("/Alarms/LowCellVoltage".into(), alarm(p.cell_undervoltage()));
    put("/Alarms/HighVoltage".into(), alarm(p.pack_overvoltage()));
    put("/Alarms/LowVoltage".into(), alarm(p.pack_undervoltage()));
    put("/Alarms/HighChargeTemperature".into(), alarm(p.charge_overtemperature()));
    put("/Alarms/LowChargeTemperature".into(), alarm(p.charge_undertemperature()));
    put("/Alarms/HighTemperature".into(), alarm(p.discharge_overtemperature()));
    put("/Alarms/LowTemperature".into(), alarm(p.discharge_undertemperature()));
    put("/Alarms/HighChargeCurrent".into(), alarm(p.charge_overcurrent()));
    put("/Alarms/HighDischargeCurrent".into(), alarm(p.discharge_overcurrent() || p.short_circuit()));
    put("/Alarms/InternalFailure".into(), alarm(p.internal_failure() || p.fet_locked()));
    put("/Alarms/CellImbalance".into(), json!(state.cell_imbalance.code()));
    put("/Alarms/LowSoc".into(), json!(state.soc_low.code()));
    put("/History/ChargeCycles".into(), json!(state.charge_cycles));

    put("/Virtual/Topology".into(), json!(state.topology.to_string()));
    put("/Virtual/VoltageImbalance".into(), flag(state.imbalance.voltage));
    put("/Virtual/CurrentImbalance".into(), flag(state.imbalance.current));
    put("/Virtual/SocImbalance".into(), flag(state.imbalance.soc));
    put("/Virtual/ImbalanceDerated".into(), flag(limits.imbalance_derated));
    put("/Virtual/HoldActive".into(), flag(limits.hold_active));
    put("/Virtual/TotalBatteries".into(), json!(state.total_unit_count));
    put("/Virtual/ActiveBatteries".into(), json!(state.active_unit_count));

    put("/System/NrOfCellsPerBattery".into(), json!(state.cell_count));
    put("/System/NrOfModulesOnline".into(), json!(state.active_unit_count));
    put(
        "/System/NrOfModulesOffline".into(),
        json!(state.total_unit_count - state.active_unit_count.min(state.total_unit_count)),
    );
    put("/System/MinCellTemperature".into(), opt(state.temperature_min));
    put("/System/MaxCellTemperature".into(), opt(state.temperature_max));
    put(
        "/Balancing".into(),
        flag(state.cells.iter().any(|c| c.balancing)),
    );

    if let Some(stats) = &state.cell_stats {
        put("/System/MinCellVoltage".into(), json!(stats.min));
        put("/System/MaxCellVoltage".into(), json!(stats.max));
        put("/System/MinVoltageCellId".into(), json!(stats.min_cell));
        put("/System/MaxVoltageCellId".into(), json!(stats.max_cell));
        put("/CellMonitor/Statistics/MinVoltage".into(), json!(stats.min));
        put("/CellMonitor/Statistics/MaxVoltage".into(), json!(stats.max));
        put("/CellMonitor/Statistics/AvgVoltage".into(), json!(stats.avg));
        put("/CellMonitor/Spread".into(), json!(stats.spread));
        put("/CellMonitor/Statistics/MaxSpread".into(), json!(stats.max_unit_spread));
        put("/CellMonitor/Alerts/Count".into(), json!(stats.alert_count));
    }
    put("/CellMonitor/BatteryCount".into(), json!(state.active_unit_count));

    // One configured unit: flat `/Voltages/Cell3`. Several: `/Voltages/Cell2-3`.
    if units.len() == 1 {
        for cell in &state.cells {
            let n = cell.index + 1;
            put(format!("/Voltages/Cell{n}"), json!(cell.voltage));
            put(format!("/Balances/Cell{n}"), flag(cell.balancing));
        }
    } else {
        for unit in units.iter().filter(|u| u.is_live()) {
            for (i, &voltage) in unit.cell_voltages.iter().enumerate() {
                let tag = crate::model::cell_tag(unit.id, i);
                let balancing = unit.cell_balancing.get(i).copied().unwrap_or(false);
                put(format!("/Voltages/Cell{tag}"), json!(voltage));
                put(format!("/Balances/Cell{tag}"), flag(balancing));
            }
        }
    }

    for view in &state.units {
        let base = format!("/Batteries/{}", view.id.number());
        put(format!("{base}/Address"), json!(view.address));
        put(format!("{base}/Status"), json!(view.status.as_str()));
        put(format!("{base}/Voltage"), json!(view.voltage));
        put(format!("{base}/Current"), json!(view.current));
        put(format!("{base}/Soc"), json!(view.soc));
        put(format!("{base}/Capacity"), json!(view.capacity_total));
        put(format!("{base}/CellCount"), json!(view.cell_count));
        put(format!("{base}/FrameErrors"), json!(view.consecutive_errors));
        if let Some(decision) = &view.decision {
            put(format!("{base}/MaxChargeCurrent"), json!(decision.charge_current_limit));
            put(format!("{base}/MaxDischargeCurrent"), json!(decision.discharge_current_limit));
        }
    }
    map
}

/// Writes the attribute map to the log
pub struct LogPublisher {
    logger: StructuredLogger,
    cycles: u64,
    summary_every: u64,
}

impl LogPublisher {
    /// Log a one-line summary every `summary_every` cycles; the full map
    /// goes out at debug level every cycle.
    pub fn new(summary_every: u64) -> Self {
        Self {
            logger: get_logger("publish"),
            cycles: 0,
            summary_every: summary_every.max(1),
        }
    }

    pub const fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl Default for LogPublisher {
    fn default() -> Self {
        Self::new(60)
    }
}

#[async_trait::async_trait]
impl Publisher for LogPublisher {
    async fn publish(&mut self, state: &VirtualBatteryState, units: &[UnitState]) -> Result<()> {
        let map = attribute_map(state, units);
        self.logger.debug(&serde_json::to_string(&map)?);

        if self.cycles % self.summary_every == 0 {
            self.logger.info(&format!(
                "{:.2} V {:.2} A SOC {} charge {:.1} A discharge {:.1} A, {}/{} units",
                state.voltage,
                state.current,
                state
                    .soc
                    .map_or_else(|| "-".to_string(), |s| format!("{s:.1}%")),
                state.limits.charge_current_limit,
                state.limits.discharge_current_limit,
                state.active_unit_count,
                state.total_unit_count
            ));
        }
        self.cycles = self.cycles.wrapping_add(1);
        Ok(())
    }
}
