use btbattery::config::{WatchdogAction, WatchdogSettings};
use btbattery::error::BtBatteryError;
use btbattery::watchdog::Watchdog;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

fn settings(timeout_secs: u64, action: WatchdogAction) -> WatchdogSettings {
    WatchdogSettings {
        timeout: Duration::from_secs(timeout_secs),
        action,
        check_interval: Duration::from_millis(500),
    }
}

#[tokio::test(start_paused = true)]
async fn log_action_rearms_and_keeps_running() {
    let watchdog = Watchdog::new(settings(2, WatchdogAction::Log));
    let handle = watchdog.handle();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(watchdog.monitor(rx));

    sleep(Duration::from_millis(2700)).await;
    assert_eq!(handle.expiries(), 1);
    assert!(!task.is_finished());

    // Re-armed at the first expiry, so it fires again one timeout later
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(handle.expiries(), 2);

    tx.send(true).unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn resets_hold_off_expiry() {
    let watchdog = Watchdog::new(settings(2, WatchdogAction::Restart));
    let handle = watchdog.handle();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(watchdog.monitor(rx));

    for _ in 0..10 {
        sleep(Duration::from_secs(1)).await;
        handle.reset();
    }
    assert!(!task.is_finished());
    assert_eq!(handle.expiries(), 0);

    tx.send(true).unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn restart_action_returns_expiry() {
    let watchdog = Watchdog::new(settings(2, WatchdogAction::Restart));
    let (_tx, rx) = watch::channel(false);
    let err = watchdog.monitor(rx).await.unwrap_err();
    assert!(matches!(
        err,
        BtBatteryError::WatchdogExpiry {
            timeout_secs: 2,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn disabled_watchdog_waits_for_shutdown() {
    let watchdog = Watchdog::new(settings(0, WatchdogAction::Restart));
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(watchdog.monitor(rx));

    sleep(Duration::from_secs(3600)).await;
    assert!(!task.is_finished());
    tx.send(true).unwrap();
    assert!(task.await.unwrap().is_ok());
}
