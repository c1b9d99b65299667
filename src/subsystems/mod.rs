//! Actuator units that sit on the bus next to the supervisor.
//!
//! Each unit implements [`UnitController`]; a [`DeviceManager`] drives a set
//! of them on one bus node through self-check, the readiness handshake, the
//! wait for `start` and the periodic update loop.

pub mod brake;
pub mod motor;
pub mod steer;

pub use brake::{BrakeProbe, BrakeState, BrakeUnit};
pub use motor::{MotorDirection, MotorDriver, MotorProbe, MotorState, SimulatedMotor};
pub use steer::{SteerProbe, SteerState, SteerUnit};

use crate::bus::{BusAdapter, Dispatcher};
use crate::error::BusError;
use crate::protocol::BusMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What a routed message meant to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitEvent {
    Idle,
    Acknowledged,
    Start,
    Stop,
    Restart,
}

pub trait UnitController: Send {
    /// Device token this unit answers to.
    fn device(&self) -> &'static str;

    fn self_check(&mut self) -> bool;

    /// Announce readiness to the supervisor once.
    fn send_ready(&mut self, bus: &BusAdapter) -> Result<(), BusError>;

    /// True once after `start` was received.
    fn wait_for_start(&mut self) -> bool;

    fn update(&mut self, bus: &BusAdapter);

    fn stop(&mut self);

    fn handle_message(&mut self, message: &BusMessage) -> UnitEvent;
}

#[derive(Debug, Clone, Copy)]
pub struct UnitTiming {
    pub ready_retry: Duration,
    pub ready_timeout: Duration,
    pub update_period: Duration,
}

impl Default for UnitTiming {
    fn default() -> Self {
        Self {
            ready_retry: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(5),
            update_period: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    AwaitStart,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerExit {
    SelfCheckFailed,
    BusClosed,
}

pub struct DeviceManager {
    bus: Arc<BusAdapter>,
    dispatcher: Dispatcher,
    controllers: Vec<Box<dyn UnitController>>,
    timing: UnitTiming,
}

impl DeviceManager {
    pub fn new(bus: Arc<BusAdapter>, controllers: Vec<Box<dyn UnitController>>) -> Self {
        Self::with_timing(bus, controllers, UnitTiming::default())
    }

    pub fn with_timing(
        bus: Arc<BusAdapter>,
        controllers: Vec<Box<dyn UnitController>>,
        timing: UnitTiming,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&bus)),
            bus,
            controllers,
            timing,
        }
    }

    /// Run until the node's bus adapter is shut down.
    pub async fn run(mut self) -> ManagerExit {
        let node = self.bus.device_name().to_string();

        let failed: Vec<&'static str> = self
            .controllers
            .iter_mut()
            .filter_map(|c| (!c.self_check()).then(|| c.device()))
            .collect();
        if !failed.is_empty() {
            error!(node = %node, ?failed, "self-check failed, aborting");
            self.stop_all();
            return ManagerExit::SelfCheckFailed;
        }

        let mut phase = Phase::Ready;
        loop {
            debug!(node = %node, ?phase, "unit phase");
            phase = match phase {
                Phase::Ready => self.ready_phase().await,
                Phase::AwaitStart => self.await_start().await,
                Phase::Running => self.running().await,
                Phase::Closed => break,
            };
        }

        self.stop_all();
        info!(node = %node, "unit node stopped");
        ManagerExit::BusClosed
    }

    /// Re-send readiness until acknowledged or the handshake times out.
    async fn ready_phase(&mut self) -> Phase {
        let deadline = Instant::now() + self.timing.ready_timeout;
        let mut acknowledged = vec![false; self.controllers.len()];
        let mut retry = tokio::time::interval(self.timing.ready_retry);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = retry.tick() => {
                    if Instant::now() >= deadline {
                        warn!(node = self.bus.device_name(), "no ready_ack, continuing anyway");
                        return Phase::AwaitStart;
                    }
                    for (controller, acked) in self.controllers.iter_mut().zip(&acknowledged) {
                        if *acked {
                            continue;
                        }
                        if let Err(err) = controller.send_ready(&self.bus) {
                            warn!(device = controller.device(), %err, "ready not sent");
                        }
                    }
                }
                message = self.dispatcher.recv() => {
                    let Some(message) = message else {
                        return Phase::Closed;
                    };
                    for (index, event) in self.route(&message).into_iter().enumerate() {
                        match event {
                            UnitEvent::Acknowledged => acknowledged[index] = true,
                            UnitEvent::Restart => return Phase::Ready,
                            UnitEvent::Stop | UnitEvent::Start | UnitEvent::Idle => {}
                        }
                    }
                    if acknowledged.iter().all(|acked| *acked) {
                        info!(node = self.bus.device_name(), "readiness acknowledged");
                        return Phase::AwaitStart;
                    }
                }
            }
        }
    }

    async fn await_start(&mut self) -> Phase {
        loop {
            let mut started = false;
            for controller in &mut self.controllers {
                started |= controller.wait_for_start();
            }
            if started {
                info!(node = self.bus.device_name(), "start received");
                return Phase::Running;
            }

            let Some(message) = self.dispatcher.recv().await else {
                return Phase::Closed;
            };
            if self.route(&message).contains(&UnitEvent::Restart) {
                return Phase::Ready;
            }
        }
    }

    async fn running(&mut self) -> Phase {
        let mut tick = tokio::time::interval(self.timing.update_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for controller in &mut self.controllers {
                        controller.update(&self.bus);
                    }
                }
                message = self.dispatcher.recv() => {
                    let Some(message) = message else {
                        return Phase::Closed;
                    };
                    let events = self.route(&message);
                    if events.contains(&UnitEvent::Restart) {
                        return Phase::Ready;
                    }
                    if events.contains(&UnitEvent::Stop) {
                        self.stop_all();
                        return Phase::AwaitStart;
                    }
                    if events.contains(&UnitEvent::Start) {
                        // Re-issued start while running; consume the latch.
                        for controller in &mut self.controllers {
                            controller.wait_for_start();
                        }
                    }
                }
            }
        }
    }

    fn route(&mut self, message: &BusMessage) -> Vec<UnitEvent> {
        self.controllers
            .iter_mut()
            .map(|controller| controller.handle_message(message))
            .collect()
    }

    fn stop_all(&mut self) {
        for controller in &mut self.controllers {
            controller.stop();
        }
    }
}
