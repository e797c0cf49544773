use super::machine::{LinkMachine, Reconnect};
use super::transport::{Connector, LinkHandle, PollError};
use crate::config::{LinkSettings, UnitSettings};
use crate::error::FrameError;
use crate::logging::{StructuredLogger, get_unit_logger};
use crate::model::ConnectionStatus;
use crate::protocol::{Command, Frame};
use crate::supervisor::shutdown_signalled;
use crate::unit::UnitWriter;
use crate::watchdog::WatchdogHandle;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    /// Reconnect budget used up; the unit stays Stale
    BudgetExhausted,
}

/// Why serving an established link stopped
enum Served {
    Shutdown,
    Lost,
}

/// Owns one unit's wireless link for the lifetime of the process
pub struct LinkSession<C: Connector> {
    connector: Arc<C>,
    unit: UnitSettings,
    link: LinkSettings,
    writer: UnitWriter,
    watchdog: WatchdogHandle,
    machine: LinkMachine,
    logger: StructuredLogger,
}

impl<C: Connector> LinkSession<C> {
    pub fn new(
        connector: Arc<C>,
        unit: UnitSettings,
        link: LinkSettings,
        writer: UnitWriter,
        watchdog: WatchdogHandle,
    ) -> Self {
        let logger = get_unit_logger("link", unit.id, &unit.address);
        Self {
            connector,
            machine: LinkMachine::new(link.clone()),
            unit,
            link,
            writer,
            watchdog,
            logger,
        }
    }

    fn transition(&self, status: ConnectionStatus) {
        let previous = self.writer.read().map(|u| u.status);
        if previous != Some(status) {
            self.logger.info(&format!(
                "{} -> {}",
                previous.unwrap_or_default(),
                status
            ));
        }
        self.writer.set_status(status);
    }

    /// Connect, serve, and reconnect until shutdown or until the reconnect
    /// budget runs out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionEnd {
        let address = self.unit.address.clone();
        let connector = self.connector.clone();
        let link = self.link.clone();
        loop {
            if *shutdown.borrow() {
                return self.finish();
            }

            let status = self.machine.start_connect();
            self.transition(status);

            let attempt = tokio::select! {
                biased;
                () = shutdown_signalled(&mut shutdown) => None,
                r = LinkHandle::connect(&*connector, &address, &link) => Some(r),
            };
            let Some(attempt) = attempt else {
                return self.finish();
            };

            let delay = match attempt {
                Ok(handle) => {
                    let status = self.machine.on_connected();
                    self.transition(status);
                    match self.serve(handle, &mut shutdown).await {
                        Served::Shutdown => return self.finish(),
                        Served::Lost => self.link.backoff(0),
                    }
                }
                Err(e) => {
                    self.logger.warn(&format!(
                        "Connect attempt {} failed: {}",
                        self.machine.failed_attempts() + 1,
                        e
                    ));
                    match self.machine.on_connect_failed() {
                        Reconnect::After(delay) => delay,
                        Reconnect::GiveUp => {
                            self.transition(self.machine.status());
                            self.logger.error(&format!(
                                "Giving up after {} failed connect attempts",
                                self.machine.failed_attempts()
                            ));
                            return SessionEnd::BudgetExhausted;
                        }
                    }
                }
            };

            tokio::select! {
                biased;
                () = shutdown_signalled(&mut shutdown) => return self.finish(),
                () = sleep(delay) => {}
            }
        }
    }

    fn finish(&mut self) -> SessionEnd {
        let status = self.machine.on_shutdown();
        self.transition(status);
        SessionEnd::Shutdown
    }

    async fn serve(
        &mut self,
        mut handle: LinkHandle<C::Transport>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Served {
        let mut last_frame = Instant::now();
        let mut next_request = Instant::now();

        loop {
            let now = Instant::now();
            if now >= next_request {
                next_request = now + self.link.request_interval;
                for command in [Command::GeneralInfo, Command::CellVoltages] {
                    if let Err(e) = handle.request(command).await {
                        self.logger.warn(&format!("Request failed: {e}"));
                        let status = self.machine.on_link_lost();
                        return self.drop_link(handle, status).await;
                    }
                }
            }

            let polled = tokio::select! {
                biased;
                () = shutdown_signalled(shutdown) => None,
                polled = handle.poll() => Some(polled),
            };
            let Some(polled) = polled else {
                handle.disconnect().await;
                return Served::Shutdown;
            };

            match polled {
                Ok(Some(frame)) => match self.accept(&frame) {
                    Ok(()) => last_frame = Instant::now(),
                    Err(e) => {
                        if self.reject(&e) {
                            return self.drop_link(handle, ConnectionStatus::Reconnecting).await;
                        }
                    }
                },
                Ok(None) => {}
                Err(PollError::Frame(e)) => {
                    if self.reject(&e) {
                        return self.drop_link(handle, ConnectionStatus::Reconnecting).await;
                    }
                }
                Err(PollError::Link(e)) => {
                    self.logger.warn(&format!("Link lost: {e}"));
                    let status = self.machine.on_link_lost();
                    return self.drop_link(handle, status).await;
                }
            }

            if last_frame.elapsed() > self.link.stale_after {
                self.logger.warn(&format!(
                    "No valid frame for {} s",
                    self.link.stale_after.as_secs()
                ));
                let status = self.machine.on_stale();
                return self.drop_link(handle, status).await;
            }
        }
    }

    async fn drop_link(&self, mut handle: LinkHandle<C::Transport>, status: ConnectionStatus) -> Served {
        handle.disconnect().await;
        self.transition(status);
        Served::Lost
    }

    /// Store a decoded frame in this unit's slot
    fn accept(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let now = Instant::now();
        let unit = &self.unit;
        let applied = self
            .writer
            .update(|state| match frame {
                Frame::GeneralInfo(info) => state.apply_general(info, unit, now),
                Frame::CellVoltages(cells) => state.apply_cells(cells, now),
            })
            .unwrap_or(Ok(()));
        if applied.is_ok() {
            self.machine.on_frame_ok();
            self.watchdog.reset();
            self.logger.trace(&format!("Accepted {:?} frame", frame.command()));
        }
        applied
    }

    /// Count a bad frame; true when the link has to be re-established
    fn reject(&mut self, error: &FrameError) -> bool {
        let reconnect = self.machine.on_frame_error();
        let count = self.machine.consecutive_frame_errors();
        self.writer.update(|u| u.consecutive_errors = count);
        self.logger.warn(&format!(
            "Dropped frame ({count}/{}): {error}",
            self.link.max_consecutive_frame_errors
        ));
        reconnect
    }
}
