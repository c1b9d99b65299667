use super::{UnitController, UnitEvent};
use crate::bus::BusAdapter;
use crate::error::BusError;
use crate::protocol::{device, BusMessage, Order};
use crate::transport::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const NEUTRAL_POSITION: i64 = 512;
pub const LEFT_LIMIT: i64 = 100;
pub const RIGHT_LIMIT: i64 = 923;
// Dead zone around the target.
const THRESHOLD: i64 = 10;
const SLEW_PER_UPDATE: i64 = 6;
// Feedback is only published after this much movement.
const REPORT_DELTA: i64 = 2;
const CENTERING_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteerState {
    pub position: i64,
    pub target: i64,
    pub enabled: bool,
    pub running: bool,
    pub last_reported: Option<i64>,
    pub reports_sent: u32,
}

#[derive(Debug, Clone)]
pub struct SteerProbe(Arc<Mutex<SteerState>>);

impl SteerProbe {
    pub fn state(&self) -> SteerState {
        *lock(&self.0)
    }
}

/// Simulated steering column: a stepper that slews toward the commanded
/// position while enabled, with a potentiometer reporting the real position.
pub struct SteerUnit {
    state: Arc<Mutex<SteerState>>,
    start_latched: bool,
}

impl SteerUnit {
    pub fn new() -> Self {
        Self::at_position(NEUTRAL_POSITION)
    }

    pub fn at_position(position: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SteerState {
                position,
                target: NEUTRAL_POSITION,
                enabled: false,
                running: false,
                last_reported: None,
                reports_sent: 0,
            })),
            start_latched: false,
        }
    }

    pub fn probe(&self) -> SteerProbe {
        SteerProbe(Arc::clone(&self.state))
    }
}

impl Default for SteerUnit {
    fn default() -> Self {
        Self::new()
    }
}

fn slew(position: i64, target: i64) -> i64 {
    let error = target - position;
    if error.abs() < THRESHOLD {
        return position;
    }
    (position + error.clamp(-SLEW_PER_UPDATE, SLEW_PER_UPDATE)).clamp(LEFT_LIMIT, RIGHT_LIMIT)
}

impl UnitController for SteerUnit {
    fn device(&self) -> &'static str {
        device::STEER
    }

    /// Drive to neutral regardless of enable state.
    fn self_check(&mut self) -> bool {
        let mut state = lock(&self.state);
        if !(LEFT_LIMIT..=RIGHT_LIMIT).contains(&state.position) {
            warn!(position = state.position, "steering out of bounds");
            return false;
        }
        for _ in 0..CENTERING_ATTEMPTS {
            if (state.position - NEUTRAL_POSITION).abs() < THRESHOLD {
                debug!(position = state.position, "steering centered");
                return true;
            }
            state.position = slew(state.position, NEUTRAL_POSITION);
        }
        false
    }

    fn send_ready(&mut self, bus: &BusAdapter) -> Result<(), BusError> {
        bus.send_order(device::OBU, Order::SteerRdy, Some(1))
    }

    fn wait_for_start(&mut self) -> bool {
        if !self.start_latched {
            return false;
        }
        self.start_latched = false;
        lock(&self.state).running = true;
        true
    }

    fn update(&mut self, bus: &BusAdapter) {
        let mut state = lock(&self.state);

        let moved = state
            .last_reported
            .map_or(true, |last| (state.position - last).abs() >= REPORT_DELTA);
        if moved {
            match bus.send_order(device::OBU, Order::SteerPosReal, Some(state.position as u64)) {
                Ok(()) => {
                    state.last_reported = Some(state.position);
                    state.reports_sent += 1;
                }
                Err(err) => warn!(%err, "steer_pos_real not sent"),
            }
        }

        if state.running && state.enabled {
            state.position = slew(state.position, state.target);
        }
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.running = false;
        state.enabled = false;
        debug!("steering stopped");
    }

    fn handle_message(&mut self, message: &BusMessage) -> UnitEvent {
        match message.order() {
            Some(Order::Start) => {
                self.start_latched = true;
                UnitEvent::Start
            }
            Some(Order::Stop) => UnitEvent::Stop,
            Some(Order::Restart) => UnitEvent::Restart,
            Some(Order::ReadyAck) => UnitEvent::Acknowledged,
            Some(Order::SteerEnable) => {
                lock(&self.state).enabled = message.payload != 0;
                UnitEvent::Idle
            }
            Some(Order::SteerPosSet) => {
                let target = i64::try_from(message.payload).unwrap_or(RIGHT_LIMIT);
                lock(&self.state).target = target.clamp(LEFT_LIMIT, RIGHT_LIMIT);
                UnitEvent::Idle
            }
            _ => UnitEvent::Idle,
        }
    }
}
