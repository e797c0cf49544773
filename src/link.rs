//! Per-unit wireless link
//!
//! [`LinkSession`] drives one unit through
//! Disconnected → Connecting → Connected → Stale → Reconnecting, writing only
//! its own [`UnitState`](crate::model::UnitState) slot and resetting the
//! shared watchdog on every accepted frame. The radio sits behind the
//! [`Connector`]/[`Transport`] seam; the `ble` feature provides the real one.

#[cfg(feature = "ble")]
mod ble;
mod machine;
mod session;
mod transport;

#[cfg(feature = "ble")]
pub use ble::{BleConnector, BleTransport};
pub use machine::{LinkMachine, Reconnect};
pub use session::{LinkSession, SessionEnd};
pub use transport::{Connector, LinkHandle, PollError, Transport};
