#![allow(dead_code)]

use obu::config::{ObuConfig, TimingConfig};
use obu::error::{BusError, MotorError};
use obu::protocol::{device, Frame, Order};
use obu::trajectory::Step;
use obu::{AddressRegistry, BusAdapter, LoopbackBus, Mode, MotorDriver, ObuHandle, ObuStatus, OnboardUnit, SharedMode, Transport};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually<F>(mut condition: F, limit: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn registry() -> Arc<AddressRegistry> {
    Arc::new(AddressRegistry::load_default().expect("embedded registry"))
}

/// Transport that records every transmitted frame.
#[derive(Default)]
pub struct RecordingTransport {
    pub frames: Mutex<Vec<Frame>>,
    pub shutdowns: AtomicUsize,
}

impl RecordingTransport {
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn transmit(&self, frame: &Frame) -> Result<(), BusError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorCommand {
    Configure,
    Forward,
    Reverse,
    Torque(f32),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorCall {
    pub command: MotorCommand,
    /// Supervisor mode at the time of the call, once observed.
    pub mode: Option<Mode>,
    pub ok: bool,
}

/// Shared view of a [`ScriptedMotor`] after it was handed to the supervisor.
#[derive(Clone, Default)]
pub struct MotorLog {
    calls: Arc<Mutex<Vec<MotorCall>>>,
    mode: Arc<OnceLock<SharedMode>>,
    failing: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    failing_torque: Arc<Mutex<Option<f32>>>,
}

impl MotorLog {
    pub fn observe(&self, mode: SharedMode) {
        let _ = self.mode.set(mode);
    }

    pub fn calls(&self) -> Vec<MotorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<MotorCommand> {
        self.calls().into_iter().map(|call| call.command).collect()
    }

    pub fn count(&self, command: MotorCommand) -> usize {
        self.commands().into_iter().filter(|c| *c == command).count()
    }

    /// Every write fails until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every `set_torque(value)` with exactly this value fails.
    pub fn fail_torque(&self, value: Option<f32>) {
        *self.failing_torque.lock().unwrap() = value;
    }
}

/// Motor double that records every call together with the supervisor mode.
pub struct ScriptedMotor {
    log: MotorLog,
    configure_ok: bool,
}

impl ScriptedMotor {
    pub fn new() -> (Self, MotorLog) {
        let log = MotorLog::default();
        (Self { log: log.clone(), configure_ok: true }, log)
    }

    pub fn failing_configure() -> (Self, MotorLog) {
        let (mut motor, log) = Self::new();
        motor.configure_ok = false;
        (motor, log)
    }

    fn record(&mut self, command: MotorCommand) -> Result<(), MotorError> {
        let ok = match command {
            MotorCommand::Configure => self.configure_ok,
            MotorCommand::Torque(value) if *self.log.failing_torque.lock().unwrap() == Some(value) => false,
            _ => {
                let forced = self
                    .log
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                !(forced || self.log.failing.load(Ordering::SeqCst))
            }
        };
        let mode = self.log.mode.get().map(SharedMode::get);
        self.log.calls.lock().unwrap().push(MotorCall { command, mode, ok });
        if ok {
            Ok(())
        } else if command == MotorCommand::Configure {
            Err(MotorError::ConfigurationFailed)
        } else {
            Err(MotorError::WriteFailed)
        }
    }
}

impl MotorDriver for ScriptedMotor {
    fn configure(&mut self) -> Result<(), MotorError> {
        self.record(MotorCommand::Configure)
    }

    fn set_forward(&mut self) -> Result<(), MotorError> {
        self.record(MotorCommand::Forward)
    }

    fn set_reverse(&mut self) -> Result<(), MotorError> {
        self.record(MotorCommand::Reverse)
    }

    fn set_torque(&mut self, value: f32) -> Result<(), MotorError> {
        self.record(MotorCommand::Torque(value))
    }

    fn stop(&mut self) -> Result<(), MotorError> {
        self.record(MotorCommand::Stop)
    }
}

/// Short timings so scenarios finish in well under a second each.
pub fn fast_config() -> ObuConfig {
    let mut config = ObuConfig::default();
    config.timing = TimingConfig {
        readiness_poll_ms: 10,
        readiness_ceiling_ms: 2_000,
        start_settle_ms: 10,
        error_settle_ms: 50,
        restart_settle_ms: 20,
        trajectory_tick_ms: 10,
    };
    config.steering.tick_ms = 20;
    config.actuator.retry_delay_ms = 1;
    config.trajectory = vec![Step::Forward, Step::Torque { value: 5.0 }, Step::Wait { ms: 10_000 }];
    config
}

/// A supervisor on a loopback bus plus an operator node to talk to it.
pub struct Harness {
    pub registry: Arc<AddressRegistry>,
    pub bus: Arc<LoopbackBus>,
    pub operator: Arc<BusAdapter>,
    pub handle: ObuHandle,
}

impl Harness {
    pub fn start(config: ObuConfig, motor: Option<ScriptedMotor>, log: Option<&MotorLog>) -> Self {
        let registry = registry();
        let bus = LoopbackBus::new();
        let adapter = BusAdapter::on_loopback(device::OBU, Arc::clone(&registry), &bus).unwrap();
        let operator = BusAdapter::on_loopback(device::OPERATOR, Arc::clone(&registry), &bus).unwrap();

        let motor = motor.map(|m| Box::new(m) as Box<dyn MotorDriver>);
        let unit = OnboardUnit::new(config, adapter, motor).unwrap();
        if let Some(log) = log {
            log.observe(unit.shared_mode());
        }

        Self {
            registry,
            bus,
            operator,
            handle: unit.spawn(),
        }
    }

    /// Supervisor with a scripted motor, already past readiness in Manual.
    pub async fn manual(config: ObuConfig) -> (Self, MotorLog) {
        let (motor, log) = ScriptedMotor::new();
        let harness = Self::start(config, Some(motor), Some(&log));
        harness.send(Order::BrakeRdy, Some(1));
        harness.send(Order::SteerRdy, Some(1));
        assert!(harness.handle.wait_for_mode(Mode::Manual, WAIT).await, "never reached Manual");
        (harness, log)
    }

    pub fn send(&self, order: Order, payload: Option<u64>) {
        self.operator.send_order(device::OBU, order, payload).unwrap();
    }

    /// Send and wait until the supervisor has handled one more message.
    pub async fn send_and_settle(&self, order: Order, payload: Option<u64>) -> ObuStatus {
        let before = self.handle.status().messages_handled;
        self.send(order, payload);
        self.handle
            .wait_for(|status| status.messages_handled > before, WAIT)
            .await
            .expect("message not handled")
    }

    /// `(order token, payload)` of every frame addressed to `device`.
    pub fn sent_to(&self, device: &str) -> Vec<(String, u64)> {
        self.bus
            .traffic()
            .iter()
            .filter(|frame| self.registry.device_token(frame.device_code()) == Some(device))
            .map(|frame| (self.registry.decode_order(frame.order_code()).to_string(), frame.payload()))
            .collect()
    }

    pub fn count_sent(&self, device: &str, order: Order) -> usize {
        self.sent_to(device)
            .iter()
            .filter(|(token, _)| token == order.as_token())
            .count()
    }
}
