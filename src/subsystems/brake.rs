use super::{UnitController, UnitEvent};
use crate::bus::BusAdapter;
use crate::config::BrakeConfig;
use crate::error::BusError;
use crate::protocol::{device, BusMessage, Order};
use crate::transport::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const ADC_MAX: u64 = 1023;
// Commands at or above this count mean "apply".
const APPLY_THRESHOLD: u64 = 500;
const SLEW_PER_UPDATE: u64 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrakeState {
    pub position: u64,
    pub target: u64,
    pub applied: bool,
    pub running: bool,
    pub commands_received: u32,
}

#[derive(Debug, Clone)]
pub struct BrakeProbe(Arc<Mutex<BrakeState>>);

impl BrakeProbe {
    pub fn state(&self) -> BrakeState {
        *lock(&self.0)
    }
}

/// Simulated linear brake actuator with a position potentiometer.
pub struct BrakeUnit {
    state: Arc<Mutex<BrakeState>>,
    pressed: u64,
    released: u64,
    start_latched: bool,
    self_check_passes: bool,
}

impl BrakeUnit {
    /// Starts released.
    pub fn new(config: &BrakeConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrakeState {
                position: config.released_position,
                target: config.released_position,
                applied: false,
                running: false,
                commands_received: 0,
            })),
            pressed: config.pressed_position,
            released: config.released_position,
            start_latched: false,
            self_check_passes: true,
        }
    }

    /// A unit whose potentiometer reads out of range.
    pub fn faulty(config: &BrakeConfig) -> Self {
        Self {
            self_check_passes: false,
            ..Self::new(config)
        }
    }

    pub fn probe(&self) -> BrakeProbe {
        BrakeProbe(Arc::clone(&self.state))
    }
}

impl UnitController for BrakeUnit {
    fn device(&self) -> &'static str {
        device::BRAKE
    }

    fn self_check(&mut self) -> bool {
        self.self_check_passes && lock(&self.state).position <= ADC_MAX
    }

    fn send_ready(&mut self, bus: &BusAdapter) -> Result<(), BusError> {
        bus.send_order(device::OBU, Order::BrakeRdy, Some(1))
    }

    fn wait_for_start(&mut self) -> bool {
        if !self.start_latched {
            return false;
        }
        self.start_latched = false;
        lock(&self.state).running = true;
        true
    }

    fn update(&mut self, _bus: &BusAdapter) {
        let mut state = lock(&self.state);
        if !state.running {
            return;
        }
        if state.position < state.target {
            state.position = (state.position + SLEW_PER_UPDATE).min(state.target);
        } else if state.position > state.target {
            state.position = state.position.saturating_sub(SLEW_PER_UPDATE).max(state.target);
        }
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.running = false;
        state.target = state.position;
        debug!("brake stopped");
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
            Some(Order::BrakePosSet) => {
                let mut state = lock(&self.state);
                state.commands_received += 1;
                state.applied = message.payload >= APPLY_THRESHOLD;
                state.target = if state.applied { self.pressed } else { self.released };
                info!(applied = state.applied, "brake command");
                UnitEvent::Idle
            }
            _ => UnitEvent::Idle,
        }
    }
}
