use crate::config::LinkSettings;
use crate::model::ConnectionStatus;
use tokio::time::Duration;

/// What to do after a failed connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    After(Duration),
    GiveUp,
}

/// Connection state of one unit, without any I/O
#[derive(Debug, Clone)]
pub struct LinkMachine {
    settings: LinkSettings,
    status: ConnectionStatus,
    frame_errors: u32,
    failed_attempts: u32,
}

impl LinkMachine {
    pub const fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            status: ConnectionStatus::Disconnected,
            frame_errors: 0,
            failed_attempts: 0,
        }
    }

    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub const fn consecutive_frame_errors(&self) -> u32 {
        self.frame_errors
    }

    pub const fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// A connect attempt begins
    pub fn start_connect(&mut self) -> ConnectionStatus {
        self.status = match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                ConnectionStatus::Connecting
            }
            _ => ConnectionStatus::Reconnecting,
        };
        self.status
    }

    pub fn on_connected(&mut self) -> ConnectionStatus {
        self.status = ConnectionStatus::Connected;
        self.frame_errors = 0;
        self.failed_attempts = 0;
        self.status
    }

    /// Count a failed attempt; the budget decides whether to keep trying
    pub fn on_connect_failed(&mut self) -> Reconnect {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.settings.budget_exhausted(self.failed_attempts) {
            self.status = ConnectionStatus::Stale;
            return Reconnect::GiveUp;
        }
        Reconnect::After(self.settings.backoff(self.failed_attempts - 1))
    }

    pub const fn on_frame_ok(&mut self) {
        self.frame_errors = 0;
    }

    /// Count a bad frame; returns true once the link must be re-established
    pub fn on_frame_error(&mut self) -> bool {
        self.frame_errors = self.frame_errors.saturating_add(1);
        if self.frame_errors >= self.settings.max_consecutive_frame_errors {
            self.status = ConnectionStatus::Reconnecting;
            return true;
        }
        false
    }

    /// No valid frame within the data timeout
    pub const fn on_stale(&mut self) -> ConnectionStatus {
        self.status = ConnectionStatus::Stale;
        self.status
    }

    /// The transport dropped underneath an established session
    pub const fn on_link_lost(&mut self) -> ConnectionStatus {
        self.status = ConnectionStatus::Reconnecting;
        self.status
    }

    pub const fn on_shutdown(&mut self) -> ConnectionStatus {
        self.status = ConnectionStatus::Disconnected;
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(budget: Option<u32>) -> LinkMachine {
        LinkMachine::new(LinkSettings {
            request_interval: Duration::from_secs(5),
            read_wait: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(15),
            max_consecutive_frame_errors: 3,
            reconnect_attempts: budget,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(4),
            stale_after: Duration::from_secs(15),
        })
    }

    #[test]
    fn frame_errors_below_budget_keep_the_link() {
        let mut m = machine(Some(3));
        m.start_connect();
        m.on_connected();
        assert!(!m.on_frame_error());
        assert!(!m.on_frame_error());
        m.on_frame_ok();
        assert!(!m.on_frame_error());
        assert!(!m.on_frame_error());
        assert_eq!(m.status(), ConnectionStatus::Connected);
        assert!(m.on_frame_error());
        assert_eq!(m.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn first_connect_then_reconnect() {
        let mut m = machine(None);
        assert_eq!(m.start_connect(), ConnectionStatus::Connecting);
        m.on_connected();
        assert_eq!(m.on_stale(), ConnectionStatus::Stale);
        assert_eq!(m.start_connect(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn backoff_grows_until_budget_is_spent() {
        let mut m = machine(Some(3));
        m.start_connect();
        assert_eq!(m.on_connect_failed(), Reconnect::After(Duration::from_secs(1)));
        assert_eq!(m.on_connect_failed(), Reconnect::After(Duration::from_secs(2)));
        assert_eq!(m.on_connect_failed(), Reconnect::GiveUp);
        assert_eq!(m.status(), ConnectionStatus::Stale);
    }

    #[test]
    fn unlimited_budget_never_gives_up() {
        let mut m = machine(None);
        for _ in 0..50 {
            assert!(matches!(m.on_connect_failed(), Reconnect::After(d) if d <= Duration::from_secs(4)));
        }
        m.on_connected();
        assert_eq!(m.failed_attempts(), 0);
    }
}
