//! Shared data model
//!
//! Per-unit telemetry ([`UnitState`]), per-unit limit output
//! ([`LimitDecision`]) and the aggregate [`VirtualBatteryState`] recomputed
//! every poll cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::time::{Duration, Instant};

/// Position of a unit in the configured unit list (zero-based).
///
/// Displays 1-based, matching the `<unit>-<cell>` tagging scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub usize);

impl UnitId {
    /// 1-based unit number used in attribute paths and cell tags
    pub const fn number(self) -> usize {
        self.0 + 1
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Build the `<unit>-<cell>` tag for a zero-based cell index
pub fn cell_tag(unit: UnitId, cell_index: usize) -> String {
    format!("{}-{}", unit.number(), cell_index + 1)
}

/// Connection lifecycle of a unit's link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Stale,
    Reconnecting,
}

impl ConnectionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stale => "stale",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Electrical arrangement of the physical units, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    #[default]
    Series,
    Parallel,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Series => f.write_str("series"),
            Self::Parallel => f.write_str("parallel"),
        }
    }
}

/// BMS protection bitmask as reported in the general info frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Protection(pub u16);

impl Protection {
    const fn bit(self, n: u16) -> bool {
        self.0 & (1 << n) != 0
    }

    pub const fn cell_overvoltage(self) -> bool {
        self.bit(0)
    }
    pub const fn cell_undervoltage(self) -> bool {
        self.bit(1)
    }
    pub const fn pack_overvoltage(self) -> bool {
        self.bit(2)
    }
    pub const fn pack_undervoltage(self) -> bool {
        self.bit(3)
    }
    pub const fn charge_overtemperature(self) -> bool {
        self.bit(4)
    }
    pub const fn charge_undertemperature(self) -> bool {
        self.bit(5)
    }
    pub const fn discharge_overtemperature(self) -> bool {
        self.bit(6)
    }
    pub const fn discharge_undertemperature(self) -> bool {
        self.bit(7)
    }
    pub const fn charge_overcurrent(self) -> bool {
        self.bit(8)
    }
    pub const fn discharge_overcurrent(self) -> bool {
        self.bit(9)
    }
    pub const fn short_circuit(self) -> bool {
        self.bit(10)
    }
    pub const fn internal_failure(self) -> bool {
        self.bit(11)
    }
    pub const fn fet_locked(self) -> bool {
        self.bit(12)
    }

    pub const fn any(self) -> bool {
        self.0 != 0
    }

    /// Union of two masks
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Last validated snapshot of one physical unit
#[derive(Debug, Clone, Serialize)]
pub struct UnitState {
    pub id: UnitId,
    pub address: String,
    pub status: ConnectionStatus,
    /// Pack voltage (V)
    pub voltage: f64,
    /// Pack current (A), positive while charging
    pub current: f64,
    /// State of charge (%)
    pub soc: f64,
    /// Remaining capacity (Ah)
    pub capacity_remaining: f64,
    /// Nominal capacity (Ah)
    pub capacity_total: f64,
    pub cycles: u16,
    /// Temperature readings (°C), one per sensor
    pub temperatures: Vec<f64>,
    /// Cell voltages (V); length fixed once the first frame is accepted
    pub cell_voltages: Vec<f64>,
    /// Balancing flags, index-aligned with `cell_voltages`
    pub cell_balancing: Vec<bool>,
    /// Cell count set by the first accepted frame of either kind
    #[serde(skip)]
    pub(crate) fixed_cell_count: Option<usize>,
    /// Charge FET state
    pub charge_enabled: bool,
    /// Discharge FET state
    pub discharge_enabled: bool,
    pub protection: Protection,
    pub firmware_version: Option<String>,
    /// Monotonic time of the last accepted frame
    #[serde(skip)]
    pub last_update: Option<Instant>,
    /// Wall-clock time of the last accepted frame
    pub updated_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl UnitState {
    pub fn new(id: UnitId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            status: ConnectionStatus::Disconnected,
            voltage: 0.0,
            current: 0.0,
            soc: 0.0,
            capacity_remaining: 0.0,
            capacity_total: 0.0,
            cycles: 0,
            temperatures: Vec::new(),
            cell_voltages: Vec::new(),
            cell_balancing: Vec::new(),
            fixed_cell_count: None,
            charge_enabled: false,
            discharge_enabled: false,
            protection: Protection::default(),
            firmware_version: None,
            last_update: None,
            updated_at: None,
            consecutive_errors: 0,
        }
    }

    /// Connected and holding at least one accepted frame
    pub fn is_live(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.last_update.is_some()
    }

    pub const fn cell_count(&self) -> usize {
        self.cell_voltages.len()
    }

    pub fn max_cell_voltage(&self) -> Option<f64> {
        self.cell_voltages.iter().copied().reduce(f64::max)
    }

    pub fn min_cell_voltage(&self) -> Option<f64> {
        self.cell_voltages.iter().copied().reduce(f64::min)
    }

    /// Difference between the highest and lowest cell
    pub fn cell_spread(&self) -> Option<f64> {
        Some(self.max_cell_voltage()? - self.min_cell_voltage()?)
    }

    pub fn max_temperature(&self) -> Option<f64> {
        self.temperatures.iter().copied().reduce(f64::max)
    }

    pub fn min_temperature(&self) -> Option<f64> {
        self.temperatures.iter().copied().reduce(f64::min)
    }

    /// Time since the last accepted frame, `None` if none was ever accepted
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|t| now.saturating_duration_since(t))
    }

    /// Copy of this state as seen at `now`. Data older than `stale_after` is
    /// reported as [`ConnectionStatus::Stale`] whatever the link is doing, as
    /// is a connected unit that never delivered a frame.
    #[must_use]
    pub fn observed_at(&self, now: Instant, stale_after: Duration) -> Self {
        let mut view = self.clone();
        let overdue = view.age(now).map_or(
            view.status == ConnectionStatus::Connected,
            |age| age > stale_after,
        );
        if overdue {
            view.status = ConnectionStatus::Stale;
        }
        view
    }
}

/// What pushed a limit below its nominal value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    CellVoltage,
    Temperature,
    Soc,
    TimeHold,
}

/// Limitation calculator output for one unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitDecision {
    /// Allowed share of the unit's max charge current, in [0,1]
    pub charge_current_fraction: f64,
    /// Allowed share of the unit's max discharge current, in [0,1]
    pub discharge_current_fraction: f64,
    /// Volts subtracted from the charge voltage target, non-negative
    pub charge_voltage_penalty: f64,
    /// Max-voltage hold is engaged; the target switches to float voltage
    pub hold_active: bool,
    pub reasons: BTreeSet<LimitReason>,
    /// Charge current limit in amps
    pub charge_current_limit: f64,
    /// Discharge current limit in amps
    pub discharge_current_limit: f64,
}

impl LimitDecision {
    /// No restriction on either side
    pub fn unrestricted() -> Self {
        Self {
            charge_current_fraction: 1.0,
            discharge_current_fraction: 1.0,
            charge_voltage_penalty: 0.0,
            hold_active: false,
            reasons: BTreeSet::new(),
            charge_current_limit: 0.0,
            discharge_current_limit: 0.0,
        }
    }
}

/// Kind of cross-unit divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImbalanceKind {
    Voltage,
    Current,
    Soc,
}

impl fmt::Display for ImbalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voltage => f.write_str("voltage"),
            Self::Current => f.write_str("current"),
            Self::Soc => f.write_str("soc"),
        }
    }
}

/// Imbalance flags for the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ImbalanceFlags {
    pub voltage: bool,
    pub current: bool,
    pub soc: bool,
}

impl ImbalanceFlags {
    pub const fn any(self) -> bool {
        self.voltage || self.current || self.soc
    }

    pub const fn is_set(self, kind: ImbalanceKind) -> bool {
        match kind {
            ImbalanceKind::Voltage => self.voltage,
            ImbalanceKind::Current => self.current,
            ImbalanceKind::Soc => self.soc,
        }
    }
}

/// Venus alarm level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    #[default]
    Ok,
    Warning,
    Alarm,
}

impl AlarmLevel {
    /// Bus encoding: 0 ok, 1 warning, 2 alarm
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Alarm => 2,
        }
    }
}

/// A detected imbalance; emitted each cycle while active, never stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImbalanceEvent {
    pub kind: ImbalanceKind,
    /// Measured divergence (V, fraction of share, or SOC points)
    pub magnitude: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// One cell in an aggregate or per-unit cell list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedCell {
    /// `<unit>-<cell>`, both 1-based
    pub tag: String,
    pub unit: UnitId,
    /// Zero-based cell index within the unit
    pub index: usize,
    pub voltage: f64,
    pub balancing: bool,
}

/// Cross-unit cell statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellStatistics {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// `max - min` across every live cell
    pub spread: f64,
    pub min_cell: String,
    pub max_cell: String,
    /// Largest spread inside a single unit
    pub max_unit_spread: f64,
    /// Units whose own spread exceeds the alert threshold
    pub alert_count: usize,
}

/// Limits applied to the virtual battery as a whole
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateLimits {
    pub charge_fraction: f64,
    pub discharge_fraction: f64,
    /// Amps
    pub charge_current_limit: f64,
    /// Amps
    pub discharge_current_limit: f64,
    /// Volts
    pub charge_voltage_limit: f64,
    /// Battery low-voltage limit (volts)
    pub discharge_voltage_limit: f64,
    pub imbalance_derated: bool,
    pub hold_active: bool,
    pub reasons: BTreeSet<LimitReason>,
    pub allow_charge: bool,
    pub allow_discharge: bool,
}

impl AggregateLimits {
    /// Nothing allowed; used when no unit is live
    pub fn blocked() -> Self {
        Self {
            charge_fraction: 0.0,
            discharge_fraction: 0.0,
            charge_current_limit: 0.0,
            discharge_current_limit: 0.0,
            charge_voltage_limit: 0.0,
            discharge_voltage_limit: 0.0,
            imbalance_derated: false,
            hold_active: false,
            reasons: BTreeSet::new(),
            allow_charge: false,
            allow_discharge: false,
        }
    }
}

/// Read-only per-unit entry of the aggregate state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitView {
    pub id: UnitId,
    pub address: String,
    /// Status as observed this cycle (may be Stale before the link notices)
    pub status: ConnectionStatus,
    pub voltage: f64,
    pub current: f64,
    pub soc: f64,
    pub capacity_total: f64,
    pub cell_count: usize,
    pub consecutive_errors: u32,
    pub decision: Option<LimitDecision>,
}

/// The single logical battery published every cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualBatteryState {
    pub topology: TopologyMode,
    pub timestamp: DateTime<Utc>,
    /// Volts
    pub voltage: f64,
    /// Amps
    pub current: f64,
    /// Watts
    pub power: f64,
    /// Percent, `None` without live units
    pub soc: Option<f64>,
    /// Ah
    pub capacity: f64,
    /// Ah
    pub capacity_remaining: f64,
    pub cell_count: usize,
    pub temperature_max: Option<f64>,
    pub temperature_min: Option<f64>,
    /// Topology default cell list (series: all units, parallel: first live unit)
    pub cells: Vec<TaggedCell>,
    pub cell_stats: Option<CellStatistics>,
    pub imbalance: ImbalanceFlags,
    pub charge_enabled: bool,
    pub discharge_enabled: bool,
    pub protection: Protection,
    /// Worst low-SOC level across live units
    pub soc_low: AlarmLevel,
    /// Raised on cell spread alerts or any cross-unit imbalance
    pub cell_imbalance: AlarmLevel,
    /// Highest charge cycle count across live units
    pub charge_cycles: u16,
    pub limits: AggregateLimits,
    pub active_unit_count: usize,
    pub total_unit_count: usize,
    pub units: Vec<UnitView>,
}

impl VirtualBatteryState {
    /// State with no live units
    pub fn offline(topology: TopologyMode, total_unit_count: usize) -> Self {
        Self {
            topology,
            timestamp: Utc::now(),
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            soc: None,
            capacity: 0.0,
            capacity_remaining: 0.0,
            cell_count: 0,
            temperature_max: None,
            temperature_min: None,
            cells: Vec::new(),
            cell_stats: None,
            imbalance: ImbalanceFlags::default(),
            charge_enabled: false,
            discharge_enabled: false,
            protection: Protection::default(),
            soc_low: AlarmLevel::Ok,
            cell_imbalance: AlarmLevel::Ok,
            charge_cycles: 0,
            limits: AggregateLimits::blocked(),
            active_unit_count: 0,
            total_unit_count,
            units: Vec::new(),
        }
    }

    pub const fn is_online(&self) -> bool {
        self.active_unit_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_id_displays_one_based() {
        assert_eq!(UnitId(0).to_string(), "1");
        assert_eq!(cell_tag(UnitId(1), 3), "2-4");
    }

    #[test]
    fn protection_bits_decode() {
        let p = Protection(0b0001_0000_0000_0101);
        assert!(p.cell_overvoltage());
        assert!(!p.cell_undervoltage());
        assert!(p.pack_overvoltage());
        assert!(p.fet_locked());
        assert!(p.any());
        assert_eq!(Protection(1).union(Protection(2)), Protection(3));
    }

    #[test]
    fn cell_extremes_and_spread() {
        let mut unit = UnitState::new(UnitId(0), "AA");
        assert_eq!(unit.cell_spread(), None);
        unit.cell_voltages = vec![3.30, 3.35, 3.28];
        assert_eq!(unit.max_cell_voltage(), Some(3.35));
        assert_eq!(unit.min_cell_voltage(), Some(3.28));
        assert!((unit.cell_spread().unwrap() - 0.07).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn observed_at_marks_old_data_stale() {
        let mut unit = UnitState::new(UnitId(0), "AA");
        unit.status = ConnectionStatus::Connected;
        unit.last_update = Some(Instant::now());

        let fresh = unit.observed_at(Instant::now(), Duration::from_secs(15));
        assert_eq!(fresh.status, ConnectionStatus::Connected);
        assert!(fresh.is_live());

        tokio::time::advance(Duration::from_secs(16)).await;
        let old = unit.observed_at(Instant::now(), Duration::from_secs(15));
        assert_eq!(old.status, ConnectionStatus::Stale);
        assert!(!old.is_live());
        // source untouched
        assert_eq!(unit.status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn old_data_is_stale_while_reconnecting() {
        let mut unit = UnitState::new(UnitId(0), "AA");
        unit.status = ConnectionStatus::Reconnecting;
        unit.last_update = Some(Instant::now());
        let stale_after = Duration::from_secs(15);

        let recent = unit.observed_at(Instant::now(), stale_after);
        assert_eq!(recent.status, ConnectionStatus::Reconnecting);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(
            unit.observed_at(Instant::now(), stale_after).status,
            ConnectionStatus::Stale
        );

        // nothing ever received: nothing to mark
        let empty = UnitState::new(UnitId(1), "BB");
        assert_eq!(
            empty.observed_at(Instant::now(), stale_after).status,
            ConnectionStatus::Disconnected
        );
    }
}
