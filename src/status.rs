use crate::bus::DispatchStats;
use crate::fault::FaultSummary;
use crate::mode::{Component, DriveState, Mode};
use crate::steering::SteeringLoopState;
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};

pub const MODE_HISTORY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub from: Mode,
    pub to: Mode,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selectors {
    pub auto_manu: Option<u64>,
    pub direction: Option<u64>,
}

impl Selectors {
    /// Manual unless the selector explicitly asks for Auto.
    pub fn mode(&self) -> Mode {
        match self.auto_manu {
            Some(0) => Mode::Auto,
            _ => Mode::Manual,
        }
    }

    pub fn drive_state(&self) -> Option<DriveState> {
        match self.direction {
            Some(1) => Some(DriveState::Forward),
            Some(0) => Some(DriveState::Reverse),
            _ => None,
        }
    }
}

/// Point-in-time view of the supervisor, republished after every handled
/// event and transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObuStatus {
    pub mode: Mode,
    pub state: Option<DriveState>,
    pub readiness: heapless::Vec<Component, 3>,
    pub motor_ready: bool,
    pub selectors: Selectors,
    pub last_torque: Option<f32>,
    pub steering: SteeringLoopState,
    pub trajectory_active: bool,
    pub mode_history: heapless::Vec<ModeChange, MODE_HISTORY_LEN>,
    pub messages_handled: u64,
    pub dispatch: DispatchStats,
    pub error_requests: u64,
    pub faults: FaultSummary,
    pub uptime_ms: u64,
}

impl Default for ObuStatus {
    fn default() -> Self {
        Self {
            mode: Mode::Init,
            state: None,
            readiness: heapless::Vec::new(),
            motor_ready: false,
            selectors: Selectors::default(),
            last_torque: None,
            steering: SteeringLoopState::default(),
            trajectory_active: false,
            mode_history: heapless::Vec::new(),
            messages_handled: 0,
            dispatch: DispatchStats::default(),
            error_requests: 0,
            faults: FaultSummary::default(),
            uptime_ms: 0,
        }
    }
}

impl ObuStatus {
    /// Whether `mode` was entered at some point in the retained history.
    pub fn visited(&self, mode: Mode) -> bool {
        self.mode == mode || self.mode_history.iter().any(|change| change.to == mode)
    }

    /// Retained modes in the order they were entered.
    pub fn mode_sequence(&self) -> impl Iterator<Item = Mode> + '_ {
        self.mode_history.iter().map(|change| change.to)
    }
}

/// Most recent mode transitions, oldest evicted first.
pub struct ModeHistory {
    changes: HistoryBuffer<ModeChange, MODE_HISTORY_LEN>,
}

impl ModeHistory {
    pub fn new() -> Self {
        Self {
            changes: HistoryBuffer::new(),
        }
    }

    pub fn push(&mut self, change: ModeChange) {
        self.changes.write(change);
    }

    pub fn snapshot(&self) -> heapless::Vec<ModeChange, MODE_HISTORY_LEN> {
        self.changes.oldest_ordered().copied().collect()
    }
}

impl Default for ModeHistory {
    fn default() -> Self {
        Self::new()
    }
}
