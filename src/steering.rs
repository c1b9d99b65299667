use crate::bus::BusAdapter;
use crate::config::SteeringConfig;
use crate::protocol::{device, Order};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Largest target the loop accepts; positions are raw potentiometer counts.
pub const MAX_TARGET: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteeringLoopState {
    pub enabled: bool,
    pub target: Option<i64>,
    pub measurement: Option<i64>,
    pub last_command: Option<i64>,
}

/// Proportional position controller for the steering unit.
///
/// Each tick moves the setpoint at most `max_step` counts away from the
/// current measurement and only transmits when the rounded setpoint changed.
pub struct SteeringLoop {
    bus: Arc<BusAdapter>,
    kp: f64,
    max_step: f64,
    state: SteeringLoopState,
    setpoints_sent: u64,
}

impl SteeringLoop {
    pub fn new(bus: Arc<BusAdapter>, config: &SteeringConfig) -> Self {
        Self {
            bus,
            kp: config.kp,
            max_step: config.max_step,
            state: SteeringLoopState::default(),
            setpoints_sent: 0,
        }
    }

    pub fn enable(&mut self, flag: bool) {
        self.state.enabled = flag;
        if !flag {
            self.state.target = None;
            self.state.last_command = None;
        }

        debug!(enabled = flag, "steering loop");
        if let Err(err) = self
            .bus
            .send_order(device::STEER, Order::SteerEnable, Some(u64::from(flag)))
        {
            warn!(%err, "steer_enable not sent");
        }
    }

    pub fn set_target(&mut self, value: u64) {
        if value > MAX_TARGET {
            warn!(value, "steering target out of range, ignored");
            return;
        }
        self.state.target = Some(value as i64);
    }

    pub fn on_feedback(&mut self, value: u64) {
        match i64::try_from(value) {
            Ok(measurement) => self.state.measurement = Some(measurement),
            Err(_) => warn!(value, "steering feedback out of range, ignored"),
        }
    }

    /// Returns the setpoint transmitted on this tick, if any.
    pub fn tick(&mut self) -> Option<i64> {
        if !self.state.enabled {
            return None;
        }
        let (target, measurement) = (self.state.target?, self.state.measurement?);

        let command = compute_setpoint(target, measurement, self.kp, self.max_step);
        if self.state.last_command == Some(command) {
            return None;
        }

        trace!(target, measurement, command, "steering setpoint");
        match self
            .bus
            .send_order(device::STEER, Order::SteerPosSet, Some(command as u64))
        {
            Ok(()) => {
                self.state.last_command = Some(command);
                self.setpoints_sent += 1;
                Some(command)
            }
            Err(err) => {
                warn!(%err, command, "steer_pos_set not sent");
                None
            }
        }
    }

    pub fn state(&self) -> SteeringLoopState {
        self.state
    }

    pub fn setpoints_sent(&self) -> u64 {
        self.setpoints_sent
    }
}

/// `measurement + clamp(kp * error, ±max_step)`, rounded half away from zero
/// and floored at zero.
pub fn compute_setpoint(target: i64, measurement: i64, kp: f64, max_step: f64) -> i64 {
    let error = (target - measurement) as f64;
    let step = (kp * error).clamp(-max_step, max_step);
    let command = (measurement as f64 + step).round() as i64;
    command.max(0)
}
