//! # btbattery - Virtual Battery Aggregator for Bluetooth BMS units
//!
//! Presents several JBD-protocol battery management systems, reached over
//! Bluetooth LE, as one virtual battery to a Victron Venus OS style energy
//! system.
//!
//! ## Features
//!
//! - **Async-first**: one Tokio task per unit link, one poll cycle
//! - **Series or parallel**: topology-aware electrical aggregation
//! - **Charge limitation**: breakpoint tables, max-voltage hold, penalties
//! - **Imbalance detection**: voltage, current and SOC spread with de-rating
//! - **Cell monitoring**: statistics, spread alerts and history samples
//! - **Watchdog**: log or restart when no unit delivers data
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `protocol`: JBD frame codec and notification reassembly
//! - `link`: Per-unit connection state machine and transport seam
//! - `unit`: Shared per-unit state slots
//! - `limits`: Per-unit charge/discharge limitation
//! - `aggregate`: Virtual battery state and imbalance detection
//! - `cell_monitor`: Cell statistics, alerts and history
//! - `watchdog`: Process liveness watchdog
//! - `publish`: Publisher seam and attribute map
//! - `supervisor`: Task wiring and the poll cycle

pub mod aggregate;
pub mod cell_monitor;
pub mod config;
pub mod error;
pub mod limits;
pub mod link;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod publish;
pub mod supervisor;
pub mod unit;
pub mod watchdog;

// Re-export commonly used types
pub use config::{Config, Settings};
pub use error::{BtBatteryError, Result};
pub use supervisor::BatterySupervisor;
