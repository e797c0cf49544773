//! Supervisor: owns the unit tasks, the watchdog and the poll cycle
//!
//! Every poll interval the supervisor copies the unit list under one lock,
//! marks units whose data is too old as Stale, runs each live unit through
//! its limitation calculator, aggregates, publishes, and stores the result
//! on a `watch` channel of `Arc` snapshots.

use crate::aggregate::{Aggregation, Aggregator};
use crate::cell_monitor::{CellMonitor, HistorySink};
use crate::config::Settings;
use crate::error::{BtBatteryError, Result};
use crate::limits::LimitationCalculator;
use crate::link::{Connector, LinkSession, SessionEnd};
use crate::logging::{StructuredLogger, get_logger};
use crate::model::{ImbalanceEvent, ImbalanceFlags, ImbalanceKind, UnitState, VirtualBatteryState};
use crate::publish::Publisher;
use crate::unit::UnitStore;
use crate::watchdog::{Watchdog, WatchdogHandle};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, timeout};

/// Resolves once `true` is sent on the shutdown channel or its sender is
/// dropped.
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// How long unit tasks get to close their links on shutdown
const SESSION_DRAIN: Duration = Duration::from_secs(5);

pub struct BatterySupervisor {
    settings: Settings,
    store: UnitStore,
    aggregator: Aggregator,
    calculators: Vec<LimitationCalculator>,
    cell_monitor: CellMonitor,
    watchdog: Option<Watchdog>,
    watchdog_handle: WatchdogHandle,
    imbalance: ImbalanceFlags,
    snapshot_tx: watch::Sender<Arc<VirtualBatteryState>>,
    snapshot_rx: watch::Receiver<Arc<VirtualBatteryState>>,
    total_cycles: u64,
    logger: StructuredLogger,
}

impl BatterySupervisor {
    pub fn new(settings: Settings) -> Self {
        let store = UnitStore::new(&settings.units);
        let calculators = settings
            .units
            .iter()
            .map(|u| LimitationCalculator::new(u.limits.clone()))
            .collect();
        let watchdog = Watchdog::new(settings.watchdog.clone());
        let watchdog_handle = watchdog.handle();
        let initial = Arc::new(VirtualBatteryState::offline(
            settings.topology,
            settings.units.len(),
        ));
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        Self {
            store,
            aggregator: Aggregator::new(&settings),
            calculators,
            cell_monitor: CellMonitor::new(&settings.cell_monitor),
            watchdog: Some(watchdog),
            watchdog_handle,
            imbalance: ImbalanceFlags::default(),
            snapshot_tx,
            snapshot_rx,
            total_cycles: 0,
            logger: get_logger("supervisor"),
            settings,
        }
    }

    /// Hand cell history samples to `sink`
    #[must_use]
    pub fn with_history(mut self, sink: Box<dyn HistorySink>) -> Self {
        self.cell_monitor = CellMonitor::new(&self.settings.cell_monitor).with_sink(sink);
        self
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub const fn store(&self) -> &UnitStore {
        &self.store
    }

    pub fn watchdog_handle(&self) -> WatchdogHandle {
        self.watchdog_handle.clone()
    }

    pub const fn cell_monitor(&self) -> &CellMonitor {
        &self.cell_monitor
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<VirtualBatteryState>> {
        self.snapshot_rx.clone()
    }

    pub const fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Units as seen at `now`, with overdue data marked Stale
    pub fn observed_units(&self, now: Instant) -> Vec<UnitState> {
        let stale_after = self.settings.link.stale_after;
        self.store
            .snapshot()
            .iter()
            .map(|u| u.observed_at(now, stale_after))
            .collect()
    }

    /// One aggregation cycle over the current snapshot
    pub fn cycle(&mut self, now: Instant) -> (Aggregation, Vec<UnitState>) {
        let units = self.observed_units(now);
        let decisions: Vec<_> = units
            .iter()
            .zip(self.calculators.iter_mut())
            .map(|(unit, calc)| unit.is_live().then(|| calc.evaluate(unit, now)))
            .collect();

        let aggregation = self.aggregator.aggregate(&units, &decisions);
        self.cell_monitor.observe(&units, now);
        self.log_imbalance_edges(aggregation.state.imbalance, &aggregation.events);

        self.snapshot_tx
            .send_replace(Arc::new(aggregation.state.clone()));
        self.total_cycles = self.total_cycles.saturating_add(1);
        (aggregation, units)
    }

    fn log_imbalance_edges(&mut self, now: ImbalanceFlags, events: &[ImbalanceEvent]) {
        for kind in [ImbalanceKind::Voltage, ImbalanceKind::Current, ImbalanceKind::Soc] {
            match (self.imbalance.is_set(kind), now.is_set(kind)) {
                (false, true) => {
                    if let Some(e) = events.iter().find(|e| e.kind == kind) {
                        self.logger.warn(&format!(
                            "Imbalance detected ({kind}): {:.3} > {:.3}, charge de-rated",
                            e.magnitude, e.threshold
                        ));
                    }
                }
                (true, false) => self.logger.info(&format!("Imbalance cleared ({kind})")),
                _ => {}
            }
        }
        self.imbalance = now;
    }

    /// Spawn one link session per unit and run the poll cycle until shutdown.
    ///
    /// Returns an error only when the watchdog expires under the `restart`
    /// action.
    pub async fn run<C, P>(
        mut self,
        connector: Arc<C>,
        publisher: &mut P,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        C: Connector,
        P: Publisher,
    {
        self.logger.info(&format!(
            "Starting {} virtual battery with {} unit(s)",
            self.settings.topology,
            self.settings.units.len()
        ));

        let mut sessions = JoinSet::new();
        for unit in &self.settings.units {
            let Some(writer) = self.store.writer(unit.id) else {
                continue;
            };
            let session = LinkSession::new(
                connector.clone(),
                unit.clone(),
                self.settings.link.clone(),
                writer,
                self.watchdog_handle.clone(),
            );
            let label = unit.label().to_string();
            let rx = shutdown.clone();
            sessions.spawn(async move { (label, session.run(rx).await) });
        }

        let watchdog = self
            .watchdog
            .take()
            .ok_or_else(|| BtBatteryError::generic("Supervisor already started"))?;
        let mut watchdog_task = tokio::spawn(watchdog.monitor(shutdown.clone()));

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                () = shutdown_signalled(&mut shutdown) => {
                    self.logger.info("Shutdown signal received");
                    break Ok(());
                }
                joined = &mut watchdog_task => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(BtBatteryError::generic(format!("Watchdog task failed: {e}"))),
                    };
                }
                Some(ended) = sessions.join_next() => {
                    match ended {
                        Ok((label, SessionEnd::BudgetExhausted)) => self.logger.error(&format!(
                            "Unit {label} gave up reconnecting and stays stale"
                        )),
                        Ok((label, SessionEnd::Shutdown)) => {
                            self.logger.debug(&format!("Unit {label} session ended"));
                        }
                        Err(e) => self.logger.error(&format!("Unit task failed: {e}")),
                    }
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let (aggregation, units) = self.cycle(started);
                    if let Err(e) = publisher.publish(&aggregation.state, &units).await {
                        self.logger.warn(&format!("Publish failed: {e}"));
                    }
                    let took = started.elapsed();
                    if took > self.settings.poll_interval {
                        self.logger.warn(&format!(
                            "Poll cycle took {} ms, longer than the {} ms interval",
                            took.as_millis(),
                            self.settings.poll_interval.as_millis()
                        ));
                    }
                }
            }
        };

        if outcome.is_err() {
            sessions.abort_all();
            watchdog_task.abort();
        } else if timeout(SESSION_DRAIN, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            self.logger.warn("Unit sessions did not stop in time");
            sessions.abort_all();
        }
        self.logger.info("Supervisor stopped");
        outcome
    }
}
