//! Unit state storage
//!
//! One [`UnitState`] slot per configured unit. Each link session gets a
//! [`UnitWriter`] for its own slot; the supervisor reads consistent copies
//! of the whole list through [`UnitStore::snapshot`].

use crate::config::UnitSettings;
use crate::error::FrameError;
use crate::model::{ConnectionStatus, UnitId, UnitState};
use crate::protocol::{CellVoltages, GeneralInfo};
use chrono::Utc;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

/// Shared list of unit states in configured order
#[derive(Debug, Clone)]
pub struct UnitStore {
    units: Arc<RwLock<Vec<UnitState>>>,
}

impl UnitStore {
    pub fn new(units: &[UnitSettings]) -> Self {
        let states = units
            .iter()
            .map(|u| UnitState::new(u.id, u.address.clone()))
            .collect();
        Self {
            units: Arc::new(RwLock::new(states)),
        }
    }

    // A panicking writer cannot leave a slot half-written in a way that
    // matters here; keep serving the last values.
    fn read_guard(&self) -> RwLockReadGuard<'_, Vec<UnitState>> {
        self.units
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Vec<UnitState>> {
        self.units
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Copy of every unit taken under a single lock
    pub fn snapshot(&self) -> Vec<UnitState> {
        self.read_guard().clone()
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write access to one slot; `None` for an unknown id
    pub fn writer(&self, id: UnitId) -> Option<UnitWriter> {
        (id.0 < self.len()).then(|| UnitWriter {
            store: self.clone(),
            id,
        })
    }
}

/// Exclusive writer for a single unit slot
#[derive(Debug)]
pub struct UnitWriter {
    store: UnitStore,
    id: UnitId,
}

impl UnitWriter {
    /// Mutate this unit's slot under the store lock
    pub fn update<R>(&self, f: impl FnOnce(&mut UnitState) -> R) -> Option<R> {
        let mut guard = self.store.write_guard();
        guard.get_mut(self.id.0).map(f)
    }

    /// Copy of this unit's slot
    pub fn read(&self) -> Option<UnitState> {
        self.store.read_guard().get(self.id.0).cloned()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.update(|u| u.status = status);
    }
}

impl UnitState {
    /// Reject a frame disagreeing with the fixed cell count, or fix it
    fn check_cell_count(&mut self, reported: usize) -> Result<(), FrameError> {
        match self.fixed_cell_count {
            Some(fixed) if fixed != reported => Err(FrameError::malformed(format!(
                "unit {} reported {} cells, expected {}",
                self.id, reported, fixed
            ))),
            Some(_) => Ok(()),
            None => {
                self.fixed_cell_count = Some(reported);
                Ok(())
            }
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_update = Some(now);
        self.updated_at = Some(Utc::now());
        self.consecutive_errors = 0;
    }

    /// Apply a general info frame
    pub fn apply_general(
        &mut self,
        info: &GeneralInfo,
        settings: &UnitSettings,
        now: Instant,
    ) -> Result<(), FrameError> {
        self.check_cell_count(usize::from(info.cell_count))?;

        self.voltage = info.voltage;
        self.current = if settings.invert_current {
            -info.current
        } else {
            info.current
        };
        self.soc = f64::from(info.soc);
        self.capacity_remaining = info.capacity_remaining;
        self.capacity_total = match settings.capacity_ah {
            Some(fallback) if info.capacity_nominal <= 0.0 => fallback,
            _ => info.capacity_nominal,
        };
        self.cycles = info.cycles;
        self.temperatures.clone_from(&info.temperatures);
        // Flags follow the voltages; before the first cell frame there is
        // nothing to align them with.
        self.cell_balancing = info.balancing_flags(self.cell_voltages.len());
        self.charge_enabled = info.charge_fet;
        self.discharge_enabled = info.discharge_fet;
        self.protection = info.protection;
        self.firmware_version = Some(info.version_string());
        self.touch(now);
        Ok(())
    }

    /// Apply a cell voltage frame; the first one fixes the cell count
    pub fn apply_cells(&mut self, cells: &CellVoltages, now: Instant) -> Result<(), FrameError> {
        let n = cells.voltages.len();
        if n == 0 {
            return Err(FrameError::malformed("cell frame carries no cells"));
        }
        self.check_cell_count(n)?;
        if self.cell_balancing.len() != n {
            self.cell_balancing.resize(n, false);
        }
        self.cell_voltages.clone_from(&cells.voltages);
        self.touch(now);
        Ok(())
    }
}
