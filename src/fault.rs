use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const MAX_FAULT_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultSource {
    Motor,
    Brake,
    Steer,
    Pedal,
    Buttons,
    Bus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// A single actuator write failed and was retried.
    Transient,
    /// Retry bound exceeded; an Error transition was requested.
    Exhausted,
    InitFailed,
    ReadinessTimeout,
    MalformedInput,
    UnknownAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub component: FaultSource,
    pub kind: FaultKind,
    pub timestamp_ms: u64,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSummary {
    pub total_recorded: u32,
    pub active: u8,
    pub exhausted: u32,
    pub malformed_inputs: u32,
}

/// Bounded fault history. The oldest record is evicted when full.
#[derive(Debug)]
pub struct FaultLog {
    history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_id: u32,
    summary: FaultSummary,
    epoch: Instant,
}

pub type SharedFaultLog = Arc<Mutex<FaultLog>>;

impl FaultLog {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_id: 1,
            summary: FaultSummary::default(),
            epoch: Instant::now(),
        }
    }

    pub fn shared() -> SharedFaultLog {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record(&mut self, component: FaultSource, kind: FaultKind) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(FaultRecord {
            id,
            component,
            kind,
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
            resolved: false,
        });

        self.summary.total_recorded = self.summary.total_recorded.wrapping_add(1);
        match kind {
            FaultKind::Exhausted => self.summary.exhausted += 1,
            FaultKind::MalformedInput => self.summary.malformed_inputs += 1,
            _ => {}
        }
        self.refresh_active();
        id
    }

    pub fn resolve(&mut self, id: u32) -> bool {
        let found = match self.history.iter_mut().find(|f| f.id == id) {
            Some(fault) => {
                fault.resolved = true;
                true
            }
            None => false,
        };
        self.refresh_active();
        found
    }

    /// Mark every open fault of `component` resolved.
    pub fn resolve_component(&mut self, component: FaultSource) {
        for fault in self.history.iter_mut().filter(|f| f.component == component) {
            fault.resolved = true;
        }
        self.refresh_active();
    }

    pub fn active(&self) -> impl Iterator<Item = &FaultRecord> {
        self.history.iter().filter(|f| !f.resolved)
    }

    pub fn history(&self) -> &[FaultRecord] {
        &self.history
    }

    pub fn summary(&self) -> FaultSummary {
        self.summary
    }

    pub fn clear_resolved(&mut self) {
        self.history.retain(|f| !f.resolved);
    }

    fn refresh_active(&mut self) {
        self.summary.active = self.active().count() as u8;
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut log = FaultLog::new();
        for _ in 0..(MAX_FAULT_HISTORY + 5) {
            log.record(FaultSource::Motor, FaultKind::Transient);
        }
        assert_eq!(log.history().len(), MAX_FAULT_HISTORY);
        assert_eq!(log.history()[0].id, 6);
        assert_eq!(log.summary().total_recorded, (MAX_FAULT_HISTORY + 5) as u32);
    }

    #[test]
    fn test_resolution() {
        let mut log = FaultLog::new();
        let motor = log.record(FaultSource::Motor, FaultKind::Exhausted);
        log.record(FaultSource::Brake, FaultKind::ReadinessTimeout);
        log.record(FaultSource::Brake, FaultKind::ReadinessTimeout);
        assert_eq!(log.summary().active, 3);

        assert!(log.resolve(motor));
        assert!(!log.resolve(999));
        log.resolve_component(FaultSource::Brake);
        assert_eq!(log.active().count(), 0);
        assert_eq!(log.summary().exhausted, 1);

        log.clear_resolved();
        assert!(log.history().is_empty());
    }
}
