//! Supervisory state machine of the on-board unit.
//!
//! The supervisor is a single task owning mode, drive state, readiness and
//! selector state. It reacts to four sources: bus frames (through the
//! [`Dispatcher`]), mode requests (actuator escalation and the operator
//! handle), the steering tick, and its own transition chain. Other tasks only
//! ever read the mode through [`SharedMode`].

use crate::bus::{BusAdapter, Dispatcher};
use crate::config::ObuConfig;
use crate::error::{BusError, ObuError};
use crate::executor::{ActuatorExecutor, RetryPolicy};
use crate::fault::{FaultKind, FaultLog, FaultRecord, FaultSource, SharedFaultLog};
use crate::mode::{
    Component, DriveState, Mode, ModeRequest, ReadinessSet, ReadinessSignals, SharedMode,
};
use crate::protocol::{device, BusMessage, Order};
use crate::status::{ModeChange, ModeHistory, ObuStatus, Selectors};
use crate::steering::SteeringLoop;
use crate::subsystems::motor::MotorDriver;
use crate::trajectory::{self, Step, TrajectoryContext, TrajectoryOutcome};
use crate::transport::lock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

fn fault_source(component: Component) -> FaultSource {
    match component {
        Component::Brake => FaultSource::Brake,
        Component::Steer => FaultSource::Steer,
        Component::Motor => FaultSource::Motor,
    }
}

/// Resolves once the readiness event carries a value.
async fn signaled(mut receiver: watch::Receiver<Option<bool>>) {
    while receiver.borrow_and_update().is_none() {
        if receiver.changed().await.is_err() {
            return;
        }
    }
}

pub struct OnboardUnit {
    config: ObuConfig,
    script: Arc<[Step]>,
    bus: Arc<BusAdapter>,
    dispatcher: Dispatcher,
    executor: Arc<ActuatorExecutor>,
    steering: SteeringLoop,
    mode: SharedMode,
    state: Option<DriveState>,
    readiness: ReadinessSet,
    signals: ReadinessSignals,
    motor_ready: bool,
    selectors: Selectors,
    faults: SharedFaultLog,
    requests_tx: mpsc::UnboundedSender<ModeRequest>,
    requests: mpsc::UnboundedReceiver<ModeRequest>,
    status_tx: watch::Sender<ObuStatus>,
    history: ModeHistory,
    trajectory: Option<JoinHandle<TrajectoryOutcome>>,
    running: bool,
    handled: u64,
    started_at: Instant,
}

impl OnboardUnit {
    /// Motor presence is decided here, once.
    pub fn new(
        config: ObuConfig,
        bus: Arc<BusAdapter>,
        motor: Option<Box<dyn MotorDriver>>,
    ) -> Result<Self, ObuError> {
        config.validate()?;

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let faults = FaultLog::shared();
        let executor = Arc::new(ActuatorExecutor::new(
            motor,
            RetryPolicy::from(&config.actuator),
            requests_tx.clone(),
            Arc::clone(&faults),
        ));
        let steering = SteeringLoop::new(Arc::clone(&bus), &config.steering);
        let (status_tx, _) = watch::channel(ObuStatus::default());
        let script: Arc<[Step]> = config.trajectory.clone().into();

        Ok(Self {
            script,
            dispatcher: Dispatcher::new(Arc::clone(&bus)),
            bus,
            executor,
            steering,
            mode: SharedMode::new(Mode::Init),
            state: None,
            readiness: ReadinessSet::new(),
            signals: ReadinessSignals::new(),
            motor_ready: false,
            selectors: Selectors::default(),
            faults,
            requests_tx,
            requests,
            status_tx,
            history: ModeHistory::new(),
            trajectory: None,
            running: true,
            handled: 0,
            started_at: Instant::now(),
            config,
        })
    }

    pub fn shared_mode(&self) -> SharedMode {
        self.mode.clone()
    }

    pub fn executor(&self) -> Arc<ActuatorExecutor> {
        Arc::clone(&self.executor)
    }

    /// Run the supervisor on its own task.
    pub fn spawn(self) -> ObuHandle {
        let mode = self.mode.clone();
        let status = self.status_tx.subscribe();
        let requests = self.requests_tx.clone();
        let executor = Arc::clone(&self.executor);
        let faults = Arc::clone(&self.faults);
        let task = tokio::spawn(self.run());

        ObuHandle {
            mode,
            status,
            requests,
            executor,
            faults,
            task,
        }
    }

    pub async fn run(mut self) {
        info!(
            device = self.bus.device_name(),
            motor = self.executor.has_motor(),
            "on-board unit starting"
        );
        self.transition(Mode::Initialize).await;

        let mut steering_tick = tokio::time::interval(self.config.steering.tick());
        steering_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running {
            tokio::select! {
                Some(request) = self.requests.recv() => self.on_mode_request(request).await,
                _ = self.bus.frame_arrived() => self.drain_bus().await,
                _ = steering_tick.tick() => {
                    if self.steering.tick().is_some() {
                        self.publish_status();
                    }
                }
            }
        }

        info!("on-board unit stopped");
    }

    async fn drain_bus(&mut self) {
        while let Some(message) = self.dispatcher.try_next() {
            self.handled += 1;
            if let Some(next) = self.handle_message(message).await {
                self.transition(next).await;
            }
            if !self.running {
                return;
            }
        }
        self.publish_status();
    }

    async fn on_mode_request(&mut self, request: ModeRequest) {
        let current = self.mode.get();
        if request.mode == current {
            debug!(mode = %current, reason = request.reason, "already in requested mode");
            return;
        }
        if !self.admissible(current, request.mode) {
            warn!(from = %current, to = %request.mode, reason = request.reason, "mode request rejected");
            return;
        }

        info!(to = %request.mode, reason = request.reason, "mode request accepted");
        self.transition(request.mode).await;
    }

    /// Requests may not skip Initialize or reach Auto without a ready motor.
    fn admissible(&self, current: Mode, requested: Mode) -> bool {
        if current == Mode::Off {
            return false;
        }
        match requested {
            Mode::Off | Mode::Error | Mode::Restart => true,
            Mode::Manual => current.is_operational(),
            Mode::Auto => current.is_operational() && self.motor_ready,
            Mode::Init | Mode::Initialize | Mode::Start => false,
        }
    }

    /// Follow the transition chain starting at `target` until it settles.
    async fn transition(&mut self, target: Mode) {
        let mut next = Some(target);
        while let Some(mode) = next.take() {
            if !self.running {
                break;
            }
            next = self.enter(mode).await;
        }
        self.publish_status();
    }

    async fn enter(&mut self, mode: Mode) -> Option<Mode> {
        if self.mode.get() == Mode::Off {
            return None;
        }
        self.change_mode(mode).await;

        match mode {
            Mode::Init => None,
            Mode::Initialize => Some(self.enter_initialize().await),
            Mode::Start => Some(self.enter_start().await),
            Mode::Manual => {
                self.enter_manual().await;
                None
            }
            Mode::Auto => {
                self.enter_auto().await;
                None
            }
            Mode::Error => {
                self.enter_error().await;
                Some(Mode::Restart)
            }
            Mode::Restart => {
                self.enter_restart().await;
                Some(Mode::Initialize)
            }
            Mode::Off => {
                self.enter_off().await;
                None
            }
        }
    }

    /// Leaving Auto writes zero torque before the new mode becomes visible,
    /// both under one gate hold.
    async fn change_mode(&mut self, to: Mode) {
        let from = self.mode.get();
        if from == Mode::Auto && to != Mode::Auto {
            let mut session = self.executor.lock().await;
            if let Err(err) = session.set_torque(0.0).await {
                error!(%err, "zero torque on leaving auto failed");
            }
            self.mode.set(to);
        } else {
            self.mode.set(to);
        }

        self.history.push(ModeChange {
            from,
            to,
            at_ms: self.started_at.elapsed().as_millis() as u64,
        });
        info!(%from, %to, "mode transition");
        self.publish_status();
    }

    async fn enter_initialize(&mut self) -> Mode {
        self.readiness.clear();
        self.signals.reset();
        self.executor.rearm();
        self.motor_ready = false;
        self.state = None;

        if self.drop_stale_requests() {
            return Mode::Off;
        }

        self.configure_motor();
        if !self.wait_for_ready().await || self.drop_stale_requests() {
            return Mode::Off;
        }
        // Error requests raised during the wait were dropped with the latch set.
        self.executor.rearm();
        Mode::Start
    }

    /// Requests queued during Initialize are stale, except a shutdown.
    /// Returns `true` if one was queued.
    fn drop_stale_requests(&mut self) -> bool {
        let mut shutdown = false;
        while let Ok(request) = self.requests.try_recv() {
            if request.mode == Mode::Off {
                shutdown = true;
            } else {
                debug!(mode = %request.mode, reason = request.reason, "stale mode request dropped");
            }
        }
        shutdown
    }

    fn configure_motor(&self) {
        let signal = self.signals.sender(Component::Motor);
        match self.executor.driver() {
            None => {
                warn!("no motor fitted");
                signal.send_replace(Some(false));
            }
            Some(driver) => {
                tokio::task::spawn_blocking(move || {
                    let result = lock(&driver).configure();
                    if let Err(err) = &result {
                        error!(%err, "motor configuration failed");
                    }
                    signal.send_replace(Some(result.is_ok()));
                });
            }
        }
    }

    /// Wait for every component to signal, pumping the bus meanwhile.
    /// Returns `false` if a shutdown arrived during the wait.
    async fn wait_for_ready(&mut self) -> bool {
        let poll = self.config.timing.readiness_poll();
        let deadline = Instant::now() + self.config.timing.readiness_ceiling();

        loop {
            while let Some(message) = self.dispatcher.try_next() {
                self.handled += 1;
                if self.handle_message(message).await == Some(Mode::Off) {
                    return false;
                }
            }
            self.publish_status();

            let pending: heapless::Vec<Component, 3> = Component::ALL
                .iter()
                .copied()
                .filter(|c| self.signals.value(*c).is_none())
                .collect();
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for component in &pending {
                    error!(?component, "no readiness before ceiling, continuing degraded");
                    lock(&self.faults).record(fault_source(*component), FaultKind::ReadinessTimeout);
                }
                break;
            }

            for component in pending {
                let receiver = self.signals.subscribe(component);
                tokio::select! {
                    _ = self.bus.frame_arrived() => break,
                    request = self.requests.recv() => match request {
                        Some(request) if request.mode == Mode::Off => return false,
                        Some(request) => {
                            debug!(mode = %request.mode, "mode request ignored during initialize");
                        }
                        None => {}
                    },
                    _ = tokio::time::timeout(poll, signaled(receiver)) => {}
                }
            }
        }

        if let Some(ok) = self.signals.value(Component::Motor) {
            self.readiness.insert(Component::Motor);
            self.motor_ready = ok;
            if ok {
                lock(&self.faults).resolve_component(FaultSource::Motor);
            } else {
                lock(&self.faults).record(FaultSource::Motor, FaultKind::InitFailed);
            }
        }
        info!(
            ready = ?self.readiness.to_vec(),
            motor_ready = self.motor_ready,
            "readiness phase complete"
        );
        true
    }

    async fn enter_start(&mut self) -> Mode {
        if !self.motor_ready {
            warn!("motor initialization failed, start rejected");
            return Mode::Error;
        }

        self.send(device::BRAKE, Order::Start, None);
        tokio::time::sleep(self.config.timing.start_settle()).await;
        if self.readiness.contains(Component::Steer) {
            self.send(device::STEER, Order::Start, None);
        }

        let next = self.selectors.mode();
        info!(%next, "start complete");
        next
    }

    async fn enter_manual(&mut self) {
        self.steering.enable(false);
        if let Err(err) = self.executor.set_torque(0.0).await {
            warn!(%err, "zero torque on entering manual failed");
        }
        self.apply_direction().await;
    }

    async fn enter_auto(&mut self) {
        self.steering.enable(true);
        if let Err(err) = self.executor.set_torque(0.0).await {
            warn!(%err, "zero torque on entering auto failed");
        }

        let context = TrajectoryContext {
            executor: Arc::clone(&self.executor),
            bus: Arc::clone(&self.bus),
            mode: self.mode.clone(),
            epoch: self.mode.epoch(),
            tick: self.config.timing.trajectory_tick(),
        };
        self.trajectory = Some(trajectory::spawn(Arc::clone(&self.script), context));
    }

    async fn enter_error(&mut self) {
        if let Err(err) = self.executor.stop().await {
            error!(%err, "motor stop failed");
        }
        self.steering.enable(false);
        self.send(device::BRAKE, Order::Stop, None);
        self.send(device::STEER, Order::Stop, None);
        tokio::time::sleep(self.config.timing.error_settle()).await;
    }

    async fn enter_restart(&mut self) {
        self.send(device::BRAKE, Order::Restart, None);
        self.send(device::STEER, Order::Restart, None);
        tokio::time::sleep(self.config.timing.restart_settle()).await;
    }

    async fn enter_off(&mut self) {
        self.send(device::BRAKE, Order::Stop, None);
        self.send(device::STEER, Order::Stop, None);
        if let Err(err) = self.executor.stop().await {
            error!(%err, "motor stop failed during shutdown");
        }
        self.steering.enable(false);
        self.running = false;
        self.bus.shutdown();
        info!("bus released");
    }

    /// Route one message. Returns the mode the message asks to move to; the
    /// caller decides whether to follow it.
    async fn handle_message(&mut self, message: BusMessage) -> Option<Mode> {
        let Some(order) = message.order() else {
            warn!(order = %message.order, payload = message.payload, "unrecognized order discarded");
            return None;
        };
        let mode = self.mode.get();
        let payload = message.payload;

        match order {
            Order::BrakeRdy => self.on_ready(Component::Brake),
            Order::SteerRdy => self.on_ready(Component::Steer),
            Order::AccelPedal => {
                self.on_pedal(payload).await;
                None
            }
            Order::BrakeEnable => {
                warn!("brake_enable received, shutting down");
                Some(Mode::Off)
            }
            Order::BoutonPark => self.on_park(payload).await,
            Order::BoutonAutoManu => {
                self.selectors.auto_manu = Some(self.button(order, payload)?);
                let wanted = self.selectors.mode();
                (mode.is_operational() && wanted != mode).then_some(wanted)
            }
            Order::BoutonReverse | Order::BoutonOnOff => {
                self.selectors.direction = Some(self.button(order, payload)?);
                if mode.is_operational() {
                    self.apply_direction().await;
                }
                None
            }
            Order::SteerPosReal => {
                self.steering.on_feedback(payload);
                None
            }
            Order::SteerTarget => {
                if mode == Mode::Auto {
                    self.steering.set_target(payload);
                } else {
                    debug!(payload, "steer_target ignored outside auto");
                }
                None
            }
            Order::ReadyAck
            | Order::Start
            | Order::Stop
            | Order::Restart
            | Order::SteerPosSet
            | Order::SteerEnable
            | Order::BrakePosSet => {
                debug!(%order, "order not handled by the supervisor");
                None
            }
        }
    }

    fn on_ready(&mut self, component: Component) -> Option<Mode> {
        let device = component.device()?;
        self.readiness.insert(component);
        self.signals.signal(component, true);
        lock(&self.faults).resolve_component(fault_source(component));
        self.send(device, Order::ReadyAck, None);

        // Only Manual and Auto handle bus traffic after Initialize.
        let mode = self.mode.get();
        if mode.is_operational() {
            info!(?component, %mode, "late readiness, re-issuing start");
            self.send(device, Order::Start, None);
            if component == Component::Steer {
                self.steering.enable(mode == Mode::Auto);
            }
        }
        None
    }

    async fn on_pedal(&mut self, payload: u64) {
        if self.mode.get() != Mode::Manual {
            debug!(payload, "pedal ignored outside manual");
            return;
        }

        let full_scale = self.config.actuator.pedal_full_scale;
        if payload > full_scale {
            warn!(payload, full_scale, "pedal reading out of range, dropped");
            lock(&self.faults).record(FaultSource::Pedal, FaultKind::MalformedInput);
            return;
        }

        let torque = payload as f32 * self.config.actuator.max_torque / full_scale as f32;
        if let Err(err) = self.executor.set_torque(torque).await {
            warn!(%err, torque, "pedal torque not applied");
        }
    }

    /// Park zeroes torque and presses the brake. In Auto it also hands control
    /// back to the driver.
    async fn on_park(&mut self, payload: u64) -> Option<Mode> {
        if self.button(Order::BoutonPark, payload)? == 0 {
            debug!("park released");
            return None;
        }

        warn!("park requested");
        if let Err(err) = self.executor.set_torque(0.0).await {
            warn!(%err, "zero torque for park failed");
        }
        self.send(
            device::BRAKE,
            Order::BrakePosSet,
            Some(self.config.brake.pressed_position),
        );
        (self.mode.get() == Mode::Auto).then_some(Mode::Manual)
    }

    /// Buttons carry exactly 0 or 1.
    fn button(&self, order: Order, payload: u64) -> Option<u64> {
        if payload > 1 {
            warn!(%order, payload, "malformed button value dropped");
            lock(&self.faults).record(FaultSource::Buttons, FaultKind::MalformedInput);
            return None;
        }
        Some(payload)
    }

    /// Forward until a direction selector has been seen.
    async fn apply_direction(&mut self) {
        let wanted = self.selectors.drive_state().unwrap_or(DriveState::Forward);
        if self.state == Some(wanted) {
            return;
        }

        let result = match wanted {
            DriveState::Forward => self.executor.set_forward().await,
            DriveState::Reverse => self.executor.set_reverse().await,
            DriveState::Error => return,
        };
        match result {
            Ok(_) => {
                info!(state = ?wanted, "direction applied");
                self.state = Some(wanted);
            }
            Err(err) => {
                warn!(%err, "direction change failed");
                self.state = Some(DriveState::Error);
            }
        }
    }

    fn send(&self, device: &str, order: Order, payload: Option<u64>) {
        if let Err(err) = self.bus.send_order(device, order, payload) {
            warn!(device, %order, %err, "send failed");
            if matches!(err, BusError::UnknownAddress { .. }) {
                lock(&self.faults).record(FaultSource::Bus, FaultKind::UnknownAddress);
            }
        }
    }

    fn publish_status(&self) {
        let faults = lock(&self.faults).summary();
        let status = ObuStatus {
            mode: self.mode.get(),
            state: self.state,
            readiness: self.readiness.to_vec(),
            motor_ready: self.motor_ready,
            selectors: self.selectors,
            last_torque: self.executor.last_torque(),
            steering: self.steering.state(),
            trajectory_active: self.trajectory.as_ref().is_some_and(|t| !t.is_finished()),
            mode_history: self.history.snapshot(),
            messages_handled: self.handled,
            dispatch: self.dispatcher.stats(),
            error_requests: self.executor.error_requests(),
            faults,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        };
        self.status_tx.send_replace(status);
    }
}

/// Control surface of a running supervisor.
pub struct ObuHandle {
    mode: SharedMode,
    status: watch::Receiver<ObuStatus>,
    requests: mpsc::UnboundedSender<ModeRequest>,
    executor: Arc<ActuatorExecutor>,
    faults: SharedFaultLog,
    task: JoinHandle<()>,
}

impl ObuHandle {
    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    pub fn status(&self) -> ObuStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ObuStatus> {
        self.status.clone()
    }

    pub fn executor(&self) -> &Arc<ActuatorExecutor> {
        &self.executor
    }

    pub fn faults(&self) -> Vec<FaultRecord> {
        lock(&self.faults).history().to_vec()
    }

    /// Ask the supervisor to change mode. Requests that would skip
    /// Initialize are rejected by the supervisor.
    pub fn request_mode(&self, mode: Mode) -> bool {
        self.requests
            .send(ModeRequest::new(mode, "operator request"))
            .is_ok()
    }

    /// First published status satisfying `predicate`, or `None` on timeout.
    pub async fn wait_for<F>(&self, mut predicate: F, limit: Duration) -> Option<ObuStatus>
    where
        F: FnMut(&ObuStatus) -> bool,
    {
        let mut receiver = self.status.clone();
        let wait = async move {
            loop {
                {
                    let status = receiver.borrow_and_update();
                    if predicate(&status) {
                        return Some(status.clone());
                    }
                }
                if receiver.changed().await.is_err() {
                    let status = receiver.borrow().clone();
                    return predicate(&status).then_some(status);
                }
            }
        };
        tokio::time::timeout(limit, wait).await.ok().flatten()
    }

    pub async fn wait_for_mode(&self, mode: Mode, limit: Duration) -> bool {
        self.wait_for(|status| status.mode == mode, limit).await.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Run the Off sequence on the supervisor task and wait for it to exit.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        if !self.task.is_finished() {
            let _ = self
                .requests
                .send(ModeRequest::new(Mode::Off, "shutdown requested"));
        }
        self.task.await
    }
}
