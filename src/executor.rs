//! Actuator command executor.
//!
//! All propulsion writes go through one gate shared by the supervisor and the
//! trajectory worker, so writes from the two never interleave. A held gate is
//! an [`ActuatorSession`]; callers that need to check-then-write atomically
//! (the trajectory worker checking it is still in its Auto phase, the
//! supervisor zeroing torque before it leaves Auto) do both under one session.
//!
//! Each write is retried a bounded number of times. On exhaustion the executor
//! posts an Error mode request to the supervisor and returns the failure to
//! the caller without waiting for the transition.

use crate::config::ActuatorConfig;
use crate::error::{ActuatorError, MotorError};
use crate::fault::{FaultKind, FaultSource, SharedFaultLog};
use crate::mode::{Mode, ModeRequest};
use crate::subsystems::motor::MotorDriver;
use crate::transport::lock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, MutexGuard};
use tracing::{debug, error, warn};

pub type SharedMotor = Arc<Mutex<Box<dyn MotorDriver>>>;

/// What happened to a single executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Dropped by the torque deadband.
    Suppressed,
    /// No motor fitted; nothing to write.
    Absent,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub deadband: f32,
}

impl From<&ActuatorConfig> for RetryPolicy {
    fn from(config: &ActuatorConfig) -> Self {
        Self {
            attempts: config.retry_limit.max(1),
            delay: config.retry_delay(),
            deadband: config.torque_deadband,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    last_torque: Option<f32>,
}

pub struct ActuatorExecutor {
    motor: Option<SharedMotor>,
    gate: tokio::sync::Mutex<GateState>,
    policy: RetryPolicy,
    escalation: mpsc::UnboundedSender<ModeRequest>,
    faults: SharedFaultLog,
    error_pending: AtomicBool,
    error_requests: AtomicU64,
    writes_applied: AtomicU64,
    last_torque_bits: AtomicU32,
}

impl ActuatorExecutor {
    /// Motor presence is fixed here; with `None` every command is a no-op.
    pub fn new(
        motor: Option<Box<dyn MotorDriver>>,
        policy: RetryPolicy,
        escalation: mpsc::UnboundedSender<ModeRequest>,
        faults: SharedFaultLog,
    ) -> Self {
        Self {
            motor: motor.map(|driver| Arc::new(Mutex::new(driver))),
            gate: tokio::sync::Mutex::new(GateState::default()),
            policy,
            escalation,
            faults,
            error_pending: AtomicBool::new(false),
            error_requests: AtomicU64::new(0),
            writes_applied: AtomicU64::new(0),
            last_torque_bits: AtomicU32::new(f32::NAN.to_bits()),
        }
    }

    pub fn has_motor(&self) -> bool {
        self.motor.is_some()
    }

    /// Driver handle for work that bypasses the gate (initial configuration).
    pub fn driver(&self) -> Option<SharedMotor> {
        self.motor.clone()
    }

    /// Wait for exclusive use of the actuator channel.
    pub async fn lock(&self) -> ActuatorSession<'_> {
        ActuatorSession {
            gate: self.gate.lock().await,
            executor: self,
        }
    }

    pub async fn set_torque(&self, value: f32) -> Result<WriteOutcome, ActuatorError> {
        self.lock().await.set_torque(value).await
    }

    pub async fn set_forward(&self) -> Result<WriteOutcome, ActuatorError> {
        self.lock().await.set_forward().await
    }

    pub async fn set_reverse(&self) -> Result<WriteOutcome, ActuatorError> {
        self.lock().await.set_reverse().await
    }

    pub async fn stop(&self) -> Result<WriteOutcome, ActuatorError> {
        self.lock().await.stop().await
    }

    /// Last torque value that reached the driver.
    pub fn last_torque(&self) -> Option<f32> {
        let value = f32::from_bits(self.last_torque_bits.load(Ordering::Acquire));
        (!value.is_nan()).then_some(value)
    }

    /// Allow the next exhaustion to request an Error transition again.
    pub fn rearm(&self) {
        self.error_pending.store(false, Ordering::Release);
    }

    pub fn error_requests(&self) -> u64 {
        self.error_requests.load(Ordering::Relaxed)
    }

    pub fn writes_applied(&self) -> u64 {
        self.writes_applied.load(Ordering::Relaxed)
    }

    async fn attempt<F>(&self, command: &'static str, mut op: F) -> Result<WriteOutcome, ActuatorError>
    where
        F: FnMut(&mut dyn MotorDriver) -> Result<(), MotorError>,
    {
        let Some(motor) = &self.motor else {
            return Ok(WriteOutcome::Absent);
        };

        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            let result = {
                let mut driver = lock(motor);
                op(&mut **driver)
            };

            match result {
                Ok(()) => {
                    self.writes_applied.fetch_add(1, Ordering::Relaxed);
                    return Ok(WriteOutcome::Applied);
                }
                Err(err) => {
                    warn!(command, attempt, attempts, %err, "actuator write failed");
                    lock(&self.faults).record(FaultSource::Motor, FaultKind::Transient);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        self.escalate(command, attempts);
        Err(ActuatorError::Exhausted { command, attempts })
    }

    fn escalate(&self, command: &'static str, attempts: u32) {
        error!(command, attempts, "actuator retries exhausted");
        lock(&self.faults).record(FaultSource::Motor, FaultKind::Exhausted);

        if self.error_pending.swap(true, Ordering::AcqRel) {
            debug!(command, "error transition already requested");
            return;
        }
        self.error_requests.fetch_add(1, Ordering::Relaxed);
        if self
            .escalation
            .send(ModeRequest::new(Mode::Error, "actuator retries exhausted"))
            .is_err()
        {
            warn!("supervisor gone, error request dropped");
        }
    }
}

/// Exclusive hold on the actuator channel.
pub struct ActuatorSession<'a> {
    gate: MutexGuard<'a, GateState>,
    executor: &'a ActuatorExecutor,
}

impl ActuatorSession<'_> {
    /// Zero always reaches the driver; any other value within the deadband of
    /// the last successful write is dropped.
    pub async fn set_torque(&mut self, value: f32) -> Result<WriteOutcome, ActuatorError> {
        if value != 0.0 {
            if let Some(last) = self.gate.last_torque {
                if (value - last).abs() < self.executor.policy.deadband {
                    return Ok(WriteOutcome::Suppressed);
                }
            }
        }

        let outcome = self
            .executor
            .attempt("set_torque", |driver| driver.set_torque(value))
            .await?;
        if outcome == WriteOutcome::Applied {
            self.gate.last_torque = Some(value);
            self.executor
                .last_torque_bits
                .store(value.to_bits(), Ordering::Release);
        }
        Ok(outcome)
    }

    pub async fn set_forward(&mut self) -> Result<WriteOutcome, ActuatorError> {
        self.executor.attempt("set_forward", |driver| driver.set_forward()).await
    }

    pub async fn set_reverse(&mut self) -> Result<WriteOutcome, ActuatorError> {
        self.executor.attempt("set_reverse", |driver| driver.set_reverse()).await
    }

    pub async fn stop(&mut self) -> Result<WriteOutcome, ActuatorError> {
        let outcome = self.executor.attempt("stop", |driver| driver.stop()).await?;
        if outcome == WriteOutcome::Applied {
            self.gate.last_torque = Some(0.0);
            self.executor
                .last_torque_bits
                .store(0.0f32.to_bits(), Ordering::Release);
        }
        Ok(outcome)
    }
}
