//! Process-wide liveness watchdog
//!
//! Any unit's successful frame resets the shared timestamp through a
//! cloneable [`WatchdogHandle`]. The monitor task compares it against the
//! timeout and either logs and re-arms, or returns
//! [`BtBatteryError::WatchdogExpiry`] so the process can be restarted.

use crate::config::{WatchdogAction, WatchdogSettings};
use crate::error::{BtBatteryError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::supervisor::shutdown_signalled;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};

#[derive(Debug)]
struct Shared {
    last_reset: Instant,
    expiries: u32,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Reset side of the watchdog, handed to every link session
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    shared: Arc<Mutex<Shared>>,
}

impl WatchdogHandle {
    /// Record a valid frame
    pub fn reset(&self) {
        lock(&self.shared).last_reset = Instant::now();
    }

    pub fn last_reset(&self) -> Instant {
        lock(&self.shared).last_reset
    }

    /// How many times the watchdog fired under the `log` action
    pub fn expiries(&self) -> u32 {
        lock(&self.shared).expiries
    }
}

/// Result of one watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogCheck {
    Disabled,
    Healthy { remaining: Duration },
    Expired { elapsed: Duration },
}

pub struct Watchdog {
    shared: Arc<Mutex<Shared>>,
    settings: WatchdogSettings,
    logger: StructuredLogger,
}

impl Watchdog {
    /// Create an armed watchdog
    pub fn new(settings: WatchdogSettings) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                last_reset: Instant::now(),
                expiries: 0,
            })),
            settings,
            logger: get_logger("watchdog"),
        }
    }

    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle {
            shared: self.shared.clone(),
        }
    }

    pub const fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    pub fn check(&self, now: Instant) -> WatchdogCheck {
        if !self.settings.is_enabled() {
            return WatchdogCheck::Disabled;
        }
        let elapsed = now.saturating_duration_since(lock(&self.shared).last_reset);
        if elapsed > self.settings.timeout {
            WatchdogCheck::Expired { elapsed }
        } else {
            WatchdogCheck::Healthy {
                remaining: self.settings.timeout - elapsed,
            }
        }
    }

    fn rearm(&self, now: Instant) {
        let mut shared = lock(&self.shared);
        shared.last_reset = now;
        shared.expiries = shared.expiries.saturating_add(1);
    }

    /// Run until shutdown, or until expiry under the `restart` action
    pub async fn monitor(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.settings.is_enabled() {
            self.logger.info("Watchdog disabled");
            shutdown_signalled(&mut shutdown).await;
            return Ok(());
        }

        self.logger.info(&format!(
            "Watchdog armed: timeout {} s, action {:?}",
            self.settings.timeout.as_secs(),
            self.settings.action
        ));
        let mut ticker = interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown_signalled(&mut shutdown) => return Ok(()),
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if let WatchdogCheck::Expired { elapsed } = self.check(now) {
                        let err = BtBatteryError::watchdog_expiry(elapsed, self.settings.timeout);
                        match self.settings.action {
                            WatchdogAction::Log => {
                                self.logger.error(&format!("{err}; re-arming"));
                                self.rearm(now);
                            }
                            WatchdogAction::Restart => {
                                self.logger.error(&format!("{err}; requesting restart"));
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
    }
}
