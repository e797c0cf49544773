//! Error types and handling for btbattery
//!
//! Three layers of errors exist:
//!
//! - [`LinkError`]: transport-level failures of a single unit's wireless link.
//!   Always retryable; handled by the link session with bounded backoff.
//! - [`FrameError`]: a received frame failed structural validation. Retryable;
//!   the link session drops the frame and counts the failure.
//! - [`BtBatteryError`]: the crate-wide error used by configuration loading,
//!   the supervisor and the binary. `Validation` is the configuration error
//!   category and is fatal at startup; `WatchdogExpiry` is the only fatal
//!   runtime outcome.

use thiserror::Error;

/// Result type alias for btbattery operations
pub type Result<T> = std::result::Result<T, BtBatteryError>;

/// Transport-level failure on a unit's wireless link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The device could not be found or refused the connection
    #[error("Unit {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// Connecting or writing did not complete in time
    #[error("Link timeout for {address} after {millis} ms")]
    Timeout { address: String, millis: u64 },

    /// An established link dropped
    #[error("Link to {address} lost: {reason}")]
    Disconnected { address: String, reason: String },

    /// Local radio or adapter failure
    #[error("Adapter error: {message}")]
    Io { message: String },
}

impl LinkError {
    pub fn unreachable<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        Self::Unreachable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout<A: Into<String>>(address: A, after: std::time::Duration) -> Self {
        Self::Timeout {
            address: address.into(),
            millis: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn disconnected<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        Self::Disconnected {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Every link failure is handled by reconnecting; none escalate.
    pub const fn is_retryable(&self) -> bool {
        true
    }
}

/// A received frame failed validation and was dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Structural problem: framing bytes, length or payload layout
    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    /// Checksum mismatch
    #[error("Frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    /// The BMS answered with a non-zero status byte
    #[error("BMS rejected command {command:#04x} with status {status:#04x}")]
    Rejected { command: u8, status: u8 },

    /// Response to a command this crate never sends
    #[error("Unknown frame command {0:#04x}")]
    UnknownCommand(u8),
}

impl FrameError {
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// A bad frame is dropped and counted; the next one may be fine.
    pub const fn is_retryable(&self) -> bool {
        true
    }
}

/// Main error type for btbattery
#[derive(Debug, Error)]
pub enum BtBatteryError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors (invalid or non-monotonic configuration values)
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Wireless link errors
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Frame decode errors
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// No unit produced a valid frame within the watchdog window
    #[error("Watchdog expired: no valid frame for {elapsed_secs:.1} s (timeout {timeout_secs} s)")]
    WatchdogExpiry { elapsed_secs: f64, timeout_secs: u64 },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl BtBatteryError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new watchdog expiry error
    pub fn watchdog_expiry(elapsed: std::time::Duration, timeout: std::time::Duration) -> Self {
        Self::WatchdogExpiry {
            elapsed_secs: elapsed.as_secs_f64(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// True for the startup-fatal configuration category
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Validation { .. })
    }
}

impl From<std::io::Error> for BtBatteryError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for BtBatteryError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BtBatteryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
