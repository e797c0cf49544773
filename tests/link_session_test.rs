mod common;

use btbattery::link::{LinkSession, SessionEnd};
use btbattery::model::{ConnectionStatus, TopologyMode, UnitId};
use btbattery::unit::UnitStore;
use btbattery::watchdog::{Watchdog, WatchdogCheck};
use common::{Plan, SimConnector, cells_frame, corrupted, general_frame, settings};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep};

const ADDR: &str = "AA:BB:CC:DD:EE:01";

struct Rig {
    store: UnitStore,
    connector: Arc<SimConnector>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<SessionEnd>,
}

fn start(connector: SimConnector, tweak: impl FnOnce(&mut btbattery::Config)) -> (Rig, Watchdog) {
    let settings = settings(TopologyMode::Series, &[ADDR], tweak);
    let store = UnitStore::new(&settings.units);
    let watchdog = Watchdog::new(settings.watchdog.clone());
    let connector = Arc::new(connector);
    let session = LinkSession::new(
        connector.clone(),
        settings.units[0].clone(),
        settings.link.clone(),
        store.writer(UnitId(0)).unwrap(),
        watchdog.handle(),
    );
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(session.run(rx));
    (
        Rig {
            store,
            connector,
            shutdown: tx,
            task,
        },
        watchdog,
    )
}

#[tokio::test(start_paused = true)]
async fn healthy_unit_fills_its_slot_and_resets_watchdog() {
    let connector = SimConnector::new().then(
        ADDR,
        Plan::healthy(13.28, -4.5, 76, 100.0, &[3.31, 3.32, 3.32, 3.33]),
    );
    let (rig, watchdog) = start(connector, |_| {});

    sleep(Duration::from_secs(1)).await;
    let unit = &rig.store.snapshot()[0];
    assert_eq!(unit.status, ConnectionStatus::Connected);
    assert!((unit.voltage - 13.28).abs() < 1e-9);
    assert!((unit.current + 4.5).abs() < 1e-9);
    assert!((unit.soc - 76.0).abs() < 1e-9);
    assert_eq!(unit.cell_voltages.len(), 4);
    assert_eq!(unit.firmware_version.as_deref(), Some("1.0"));

    // Requests repeat, so the unit stays fresh past the stale window
    sleep(Duration::from_secs(30)).await;
    let unit = &rig.store.snapshot()[0];
    assert_eq!(unit.status, ConnectionStatus::Connected);
    assert!(unit.age(Instant::now()).unwrap() < Duration::from_secs(6));
    assert_eq!(rig.connector.attempts(), 1);
    // 31 s in, past the 30 s timeout, yet every frame reset it
    assert!(matches!(
        watchdog.check(Instant::now()),
        WatchdogCheck::Healthy { .. }
    ));

    rig.shutdown.send(true).unwrap();
    assert_eq!(rig.task.await.unwrap(), SessionEnd::Shutdown);
    assert_eq!(rig.store.snapshot()[0].status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn errors_below_budget_keep_the_link() {
    let general = general_frame(13.2, 1.0, 50, 100.0, 4);
    let connector = SimConnector::new().then(
        ADDR,
        Plan::chunks(vec![
            corrupted(general.clone()),
            corrupted(general.clone()),
            general,
        ]),
    );
    let (rig, _watchdog) = start(connector, |c| c.link.max_consecutive_frame_errors = 3);

    sleep(Duration::from_millis(100)).await;
    let unit = &rig.store.snapshot()[0];
    assert_eq!(unit.status, ConnectionStatus::Connected);
    assert_eq!(unit.consecutive_errors, 0);
    assert!((unit.voltage - 13.2).abs() < 1e-9);
    assert_eq!(rig.connector.attempts(), 1);

    rig.shutdown.send(true).unwrap();
    rig.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn error_counter_is_visible_before_budget_runs_out() {
    let general = general_frame(13.2, 1.0, 50, 100.0, 4);
    let connector = SimConnector::new().then(
        ADDR,
        Plan::chunks(vec![corrupted(general.clone()), corrupted(general)]),
    );
    let (rig, _watchdog) = start(connector, |c| c.link.max_consecutive_frame_errors = 3);

    sleep(Duration::from_millis(100)).await;
    let unit = &rig.store.snapshot()[0];
    assert_eq!(unit.status, ConnectionStatus::Connected);
    assert_eq!(unit.consecutive_errors, 2);

    rig.shutdown.send(true).unwrap();
    rig.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn nth_bad_frame_forces_reconnect() {
    let bad = corrupted(cells_frame(&[3.3, 3.3, 3.3, 3.3]));
    let connector = SimConnector::new().then(
        ADDR,
        Plan::chunks(vec![bad.clone(), bad.clone(), bad]),
    );
    let (rig, _watchdog) = start(connector, |c| c.link.max_consecutive_frame_errors = 3);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.store.snapshot()[0].status, ConnectionStatus::Reconnecting);
    assert_eq!(rig.connector.attempts(), 1);

    // backoff(0) later the session dials again
    sleep(Duration::from_millis(1500)).await;
    assert!(rig.connector.attempts() >= 2);

    rig.shutdown.send(true).unwrap();
    rig.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_leaves_unit_stale() {
    let (rig, _watchdog) = start(SimConnector::new(), |c| c.link.reconnect_attempts = Some(3));

    let end = rig.task.await.unwrap();
    assert_eq!(end, SessionEnd::BudgetExhausted);
    assert_eq!(rig.connector.attempts(), 3);
    assert_eq!(rig.store.snapshot()[0].status, ConnectionStatus::Stale);
}

#[tokio::test(start_paused = true)]
async fn silent_unit_goes_stale() {
    let connector = SimConnector::new().then(
        ADDR,
        Plan::chunks(vec![
            general_frame(13.2, 0.0, 50, 100.0, 4),
            cells_frame(&[3.3, 3.3, 3.3, 3.3]),
        ]),
    );
    let (rig, _watchdog) = start(connector, |c| c.link.stale_after_seconds = 2);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.store.snapshot()[0].status, ConnectionStatus::Connected);

    sleep(Duration::from_millis(1600)).await;
    assert_eq!(rig.store.snapshot()[0].status, ConnectionStatus::Stale);

    rig.shutdown.send(true).unwrap();
    assert_eq!(rig.task.await.unwrap(), SessionEnd::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_backoff() {
    let (rig, _watchdog) = start(SimConnector::new(), |c| {
        c.link.reconnect_attempts = None;
        c.link.backoff_initial_ms = 60_000;
        c.link.backoff_max_ms = 60_000;
    });

    sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.store.snapshot()[0].status, ConnectionStatus::Connecting);
    rig.shutdown.send(true).unwrap();
    assert_eq!(rig.task.await.unwrap(), SessionEnd::Shutdown);
    assert_eq!(rig.connector.attempts(), 1);
}
