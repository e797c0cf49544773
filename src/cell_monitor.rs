//! Cell statistics, spread alerts and history samples

use crate::config::CellMonitorConfig;
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{CellStatistics, UnitId, UnitState, cell_tag};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Min/max/avg and extremes across every cell of the given units.
///
/// `None` when no unit reports any cell.
pub fn statistics(units: &[&UnitState], alert_threshold: f64) -> Option<CellStatistics> {
    let mut cells = units.iter().flat_map(|u| {
        u.cell_voltages
            .iter()
            .enumerate()
            .map(move |(i, &v)| (u.id, i, v))
    });

    let (unit, index, first) = cells.next()?;
    let mut min = (first, unit, index);
    let mut max = min;
    let mut sum = first;
    let mut count = 1usize;
    for (unit, index, v) in cells {
        if v < min.0 {
            min = (v, unit, index);
        }
        if v > max.0 {
            max = (v, unit, index);
        }
        sum += v;
        count += 1;
    }

    let spreads = units.iter().filter_map(|u| u.cell_spread());
    let max_unit_spread = spreads.clone().fold(0.0, f64::max);
    let alert_count = spreads.filter(|&s| s > alert_threshold).count();

    #[allow(clippy::cast_precision_loss)]
    let avg = sum / count as f64;
    Some(CellStatistics {
        min: min.0,
        max: max.0,
        avg,
        spread: max.0 - min.0,
        min_cell: cell_tag(min.1, min.2),
        max_cell: cell_tag(max.1, max.2),
        max_unit_spread,
        alert_count,
    })
}

/// A unit whose cells drifted further apart than the alert threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellAlert {
    pub timestamp: DateTime<Utc>,
    pub unit: UnitId,
    pub address: String,
    pub spread: f64,
    pub min: f64,
    pub max: f64,
}

/// One history record per cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellSample {
    pub timestamp: DateTime<Utc>,
    pub unit: UnitId,
    pub address: String,
    /// Zero-based
    pub cell: usize,
    pub voltage: f64,
    pub balancing: bool,
}

/// Receiver of cell history samples; storage is up to the implementor
pub trait HistorySink: Send {
    fn record(&mut self, sample: &CellSample);
}

/// Forwards samples over a bounded channel, dropping them when it is full
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<CellSample>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CellSample>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, dropped: 0 }, rx)
    }

    /// Samples lost to a full or closed channel
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl HistorySink for ChannelSink {
    fn record(&mut self, sample: &CellSample) {
        if self.tx.try_send(sample.clone()).is_err() {
            self.dropped = self.dropped.saturating_add(1);
        }
    }
}

/// Keeps the alert ring and paces history samples
pub struct CellMonitor {
    alert_threshold: f64,
    max_alerts: usize,
    sample_interval: Duration,
    alerts: VecDeque<CellAlert>,
    last_sample: Option<Instant>,
    sink: Option<Box<dyn HistorySink>>,
    logger: StructuredLogger,
}

impl CellMonitor {
    pub fn new(config: &CellMonitorConfig) -> Self {
        Self {
            alert_threshold: config.alert_threshold,
            max_alerts: config.max_alerts,
            sample_interval: Duration::from_secs(config.sample_interval_seconds),
            alerts: VecDeque::new(),
            last_sample: None,
            sink: None,
            logger: get_logger("cell_monitor"),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Most recent alerts, oldest first
    pub const fn alerts(&self) -> &VecDeque<CellAlert> {
        &self.alerts
    }

    pub fn latest_alert(&self) -> Option<&CellAlert> {
        self.alerts.back()
    }

    /// Check live units for spread alerts and hand out history samples when
    /// the sample interval has passed. Returns the alerts raised this cycle.
    pub fn observe(&mut self, units: &[UnitState], now: Instant) -> Vec<CellAlert> {
        let timestamp = Utc::now();
        let live: Vec<&UnitState> = units.iter().filter(|u| u.is_live()).collect();

        let mut raised = Vec::new();
        for unit in &live {
            let (Some(spread), Some(min), Some(max)) = (
                unit.cell_spread(),
                unit.min_cell_voltage(),
                unit.max_cell_voltage(),
            ) else {
                continue;
            };
            if spread > self.alert_threshold {
                self.logger.warn(&format!(
                    "Unit {} cell spread {:.3} V (min {:.3} V, max {:.3} V)",
                    unit.id, spread, min, max
                ));
                raised.push(CellAlert {
                    timestamp,
                    unit: unit.id,
                    address: unit.address.clone(),
                    spread,
                    min,
                    max,
                });
            }
        }
        self.alerts.extend(raised.iter().cloned());
        while self.alerts.len() > self.max_alerts {
            self.alerts.pop_front();
        }

        self.sample(&live, timestamp, now);
        raised
    }

    fn sample(&mut self, live: &[&UnitState], timestamp: DateTime<Utc>, now: Instant) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let due = self
            .last_sample
            .is_none_or(|last| now.saturating_duration_since(last) >= self.sample_interval);
        if !due {
            return;
        }
        self.last_sample = Some(now);
        for unit in live {
            for (cell, &voltage) in unit.cell_voltages.iter().enumerate() {
                sink.record(&CellSample {
                    timestamp,
                    unit: unit.id,
                    address: unit.address.clone(),
                    cell,
                    voltage,
                    balancing: unit.cell_balancing.get(cell).copied().unwrap_or(false),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionStatus;

    fn live(id: usize, cells: &[f64]) -> UnitState {
        let mut u = UnitState::new(UnitId(id), format!("AA:0{id}"));
        u.status = ConnectionStatus::Connected;
        u.last_update = Some(Instant::now());
        u.cell_voltages = cells.to_vec();
        u.cell_balancing = vec![false; cells.len()];
        u
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_tag_the_extremes() {
        let a = live(0, &[3.30, 3.32]);
        let b = live(1, &[3.10, 3.45]);
        let stats = statistics(&[&a, &b], 0.2).unwrap();
        assert!((stats.min - 3.10).abs() < 1e-12);
        assert!((stats.max - 3.45).abs() < 1e-12);
        assert_eq!(stats.min_cell, "2-1");
        assert_eq!(stats.max_cell, "2-2");
        assert!((stats.avg - 3.2925).abs() < 1e-9);
        assert!((stats.max_unit_spread - 0.35).abs() < 1e-9);
        assert_eq!(stats.alert_count, 1);
        assert!(statistics(&[], 0.2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn alert_ring_is_bounded() {
        let mut monitor = CellMonitor::new(&CellMonitorConfig {
            alert_threshold: 0.2,
            max_alerts: 3,
            sample_interval_seconds: 0,
        });
        let units = [live(0, &[3.0, 3.3]), live(1, &[3.3, 3.3])];
        for _ in 0..5 {
            assert_eq!(monitor.observe(&units, Instant::now()).len(), 1);
        }
        assert_eq!(monitor.alerts().len(), 3);
        assert_eq!(monitor.latest_alert().unwrap().unit, UnitId(0));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_follow_the_interval() {
        let (sink, mut rx) = ChannelSink::new(64);
        let mut monitor = CellMonitor::new(&CellMonitorConfig {
            alert_threshold: 0.2,
            max_alerts: 10,
            sample_interval_seconds: 10,
        })
        .with_sink(Box::new(sink));
        let units = [live(0, &[3.3, 3.31])];

        monitor.observe(&units, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.observe(&units, Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.observe(&units, Instant::now());

        let mut received = Vec::new();
        while let Ok(s) = rx.try_recv() {
            received.push(s);
        }
        assert_eq!(received.len(), 4);
        assert_eq!(received[1].cell, 1);
    }

    #[test]
    fn full_channel_drops_samples() {
        let (mut sink, _rx) = ChannelSink::new(1);
        let sample = CellSample {
            timestamp: Utc::now(),
            unit: UnitId(0),
            address: "AA".to_string(),
            cell: 0,
            voltage: 3.3,
            balancing: false,
        };
        sink.record(&sample);
        sink.record(&sample);
        assert_eq!(sink.dropped(), 1);
    }
}
