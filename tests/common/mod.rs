//! Simulated BMS units behind the link seam
#![allow(dead_code)]

use btbattery::config::{Config, Settings, UnitConfig};
use btbattery::error::LinkError;
use btbattery::link::{Connector, Transport};
use btbattery::model::{ConnectionStatus, TopologyMode, UnitId, UnitState};
use btbattery::protocol::{Command, encode_response};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, Instant, sleep};

/// General info response for a pack of `cells` cells
pub fn general_frame(voltage: f64, current: f64, soc: u8, capacity: f64, cells: u8) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&((voltage * 100.0).round() as u16).to_be_bytes());
    p.extend_from_slice(&((current * 100.0).round() as i16).to_be_bytes());
    p.extend_from_slice(&((capacity * f64::from(soc)).round() as u16).to_be_bytes());
    p.extend_from_slice(&((capacity * 100.0).round() as u16).to_be_bytes());
    p.extend_from_slice(&12u16.to_be_bytes());
    p.extend_from_slice(&0x2a21u16.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.push(0x10);
    p.push(soc);
    p.push(0b11);
    p.push(cells);
    p.push(1);
    p.extend_from_slice(&2981u16.to_be_bytes());
    encode_response(Command::GeneralInfo.code(), 0, &p)
}

/// Cell voltage response
pub fn cells_frame(voltages: &[f64]) -> Vec<u8> {
    let payload: Vec<u8> = voltages
        .iter()
        .flat_map(|v| ((v * 1000.0).round() as u16).to_be_bytes())
        .collect();
    encode_response(Command::CellVoltages.code(), 0, &payload)
}

/// A frame whose checksum no longer matches
pub fn corrupted(mut frame: Vec<u8>) -> Vec<u8> {
    let at = frame.len() - 2;
    frame[at] ^= 0xff;
    frame
}

/// What one connect attempt yields
#[derive(Debug, Clone)]
pub enum Plan {
    Refuse,
    Serve {
        /// Delivered one per read, in order
        chunks: Vec<Vec<u8>>,
        /// Answers to every request pair, if the unit keeps responding
        replies: Option<(Vec<u8>, Vec<u8>)>,
    },
}

impl Plan {
    /// A unit answering every request with the same readings
    pub fn healthy(voltage: f64, current: f64, soc: u8, capacity: f64, cells: &[f64]) -> Self {
        let count = u8::try_from(cells.len()).unwrap();
        Self::Serve {
            chunks: Vec::new(),
            replies: Some((
                general_frame(voltage, current, soc, capacity, count),
                cells_frame(cells),
            )),
        }
    }

    pub fn chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self::Serve {
            chunks,
            replies: None,
        }
    }
}

#[derive(Debug, Default)]
struct Scripts {
    plans: HashMap<String, VecDeque<Plan>>,
    fallback: HashMap<String, Plan>,
}

/// Connector whose units follow scripted plans, per address
#[derive(Debug, Default)]
pub struct SimConnector {
    scripts: Mutex<Scripts>,
    attempts: AtomicU32,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `plan` for the next connect to `address`
    pub fn then(self, address: &str, plan: Plan) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .plans
            .entry(address.to_uppercase())
            .or_default()
            .push_back(plan);
        self
    }

    /// Plan used once the queue for `address` is empty (default: refuse)
    pub fn otherwise(self, address: &str, plan: Plan) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .fallback
            .insert(address.to_uppercase(), plan);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for SimConnector {
    type Transport = SimTransport;

    async fn connect(&self, address: &str) -> Result<SimTransport, LinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = {
            let mut scripts = self.scripts.lock().unwrap();
            let key = address.to_uppercase();
            let queued = scripts.plans.get_mut(&key).and_then(VecDeque::pop_front);
            queued
                .or_else(|| scripts.fallback.get(&key).cloned())
                .unwrap_or(Plan::Refuse)
        };
        match plan {
            Plan::Refuse => Err(LinkError::unreachable(address, "not advertising")),
            Plan::Serve { chunks, replies } => Ok(SimTransport {
                pending: chunks.into(),
                replies,
                closed: false,
            }),
        }
    }
}

#[derive(Debug)]
pub struct SimTransport {
    pending: VecDeque<Vec<u8>>,
    replies: Option<(Vec<u8>, Vec<u8>)>,
    closed: bool,
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if let Some((general, cells)) = &self.replies {
            if frame == Command::GeneralInfo.request() {
                self.pending.push_back(general.clone());
            } else if frame == Command::CellVoltages.request() {
                self.pending.push_back(cells.clone());
            }
        }
        Ok(())
    }

    async fn read_chunk(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        sleep(wait).await;
        Ok(None)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Resolved settings for `addresses` after `tweak`
pub fn settings(
    topology: TopologyMode,
    addresses: &[&str],
    tweak: impl FnOnce(&mut Config),
) -> Settings {
    let mut config = Config::default();
    config.topology = topology;
    config.units = addresses
        .iter()
        .map(|a| UnitConfig {
            address: (*a).to_string(),
            ..UnitConfig::default()
        })
        .collect();
    tweak(&mut config);
    config.resolve().unwrap()
}

/// A connected unit with fresh data and four equal cells
pub fn live_unit(id: usize, voltage: f64, current: f64, capacity: f64, soc: f64) -> UnitState {
    let mut u = UnitState::new(UnitId(id), format!("AA:0{id}"));
    u.status = ConnectionStatus::Connected;
    u.last_update = Some(Instant::now());
    u.voltage = voltage;
    u.current = current;
    u.capacity_total = capacity;
    u.capacity_remaining = capacity * soc / 100.0;
    u.soc = soc;
    u.cell_voltages = vec![voltage / 4.0; 4];
    u.cell_balancing = vec![false; 4];
    u.temperatures = vec![25.0];
    u.charge_enabled = true;
    u.discharge_enabled = true;
    u
}
