use crate::error::MotorError;
use crate::fault_injection::{FaultInjectionConfig, FaultInjector};
use crate::transport::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Local propulsion interface. Calls are synchronous and short; the
/// executor provides retries and serialization on top.
pub trait MotorDriver: Send {
    fn configure(&mut self) -> Result<(), MotorError>;
    fn set_forward(&mut self) -> Result<(), MotorError>;
    fn set_reverse(&mut self) -> Result<(), MotorError>;
    fn set_torque(&mut self, value: f32) -> Result<(), MotorError>;
    fn stop(&mut self) -> Result<(), MotorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorDirection {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    pub configured: bool,
    pub direction: MotorDirection,
    pub torque: f32,
    pub stopped: bool,
    pub writes_applied: u32,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            configured: false,
            direction: MotorDirection::Forward,
            torque: 0.0,
            stopped: true,
            writes_applied: 0,
        }
    }
}

/// Read side of a [`SimulatedMotor`] that outlives handing the driver over.
#[derive(Debug, Clone, Default)]
pub struct MotorProbe(Arc<Mutex<MotorState>>);

impl MotorProbe {
    pub fn state(&self) -> MotorState {
        *lock(&self.0)
    }
}

/// Motor controller stand-in with injectable transient faults.
#[derive(Debug)]
pub struct SimulatedMotor {
    state: Arc<Mutex<MotorState>>,
    injector: FaultInjector,
    max_torque: f32,
}

impl SimulatedMotor {
    pub fn new(max_torque: f32) -> Self {
        Self::with_faults(max_torque, FaultInjectionConfig::default())
    }

    pub fn with_faults(max_torque: f32, faults: FaultInjectionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MotorState::default())),
            injector: FaultInjector::new_with_config(faults),
            max_torque,
        }
    }

    pub fn probe(&self) -> MotorProbe {
        MotorProbe(Arc::clone(&self.state))
    }

    pub fn injector_mut(&mut self) -> &mut FaultInjector {
        &mut self.injector
    }

    fn write<F>(&mut self, apply: F) -> Result<(), MotorError>
    where
        F: FnOnce(&mut MotorState),
    {
        let mut state = lock(&self.state);
        if !state.configured {
            return Err(MotorError::NotConfigured);
        }
        if self.injector.write_fails() {
            trace!("injected motor write fault");
            return Err(MotorError::WriteFailed);
        }
        apply(&mut state);
        state.writes_applied += 1;
        Ok(())
    }
}

impl MotorDriver for SimulatedMotor {
    fn configure(&mut self) -> Result<(), MotorError> {
        if self.injector.configure_fails() {
            return Err(MotorError::ConfigurationFailed);
        }
        let mut state = lock(&self.state);
        *state = MotorState {
            configured: true,
            ..MotorState::default()
        };
        debug!(max_torque = self.max_torque, "simulated motor configured");
        Ok(())
    }

    fn set_forward(&mut self) -> Result<(), MotorError> {
        self.write(|state| state.direction = MotorDirection::Forward)
    }

    fn set_reverse(&mut self) -> Result<(), MotorError> {
        self.write(|state| state.direction = MotorDirection::Reverse)
    }

    fn set_torque(&mut self, value: f32) -> Result<(), MotorError> {
        let value = value.clamp(-self.max_torque, self.max_torque);
        self.write(|state| {
            state.torque = value;
            state.stopped = value == 0.0;
        })
    }

    fn stop(&mut self) -> Result<(), MotorError> {
        self.write(|state| {
            state.torque = 0.0;
            state.stopped = true;
        })
    }
}
