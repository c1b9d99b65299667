//! Scripted autonomous maneuver.
//!
//! The worker runs while the supervisor stays in the Auto phase it was
//! started for. Waits are sliced into ticks and the phase is re-checked
//! before every tick and, under the actuator gate, before every write.

use crate::bus::BusAdapter;
use crate::error::ActuatorError;
use crate::executor::ActuatorExecutor;
use crate::mode::SharedMode;
use crate::protocol::{device, Order};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Forward,
    Reverse,
    Torque { value: f32 },
    Brake { position: u64 },
    Wait { ms: u64 },
}

/// Drive forward, brake to a stop, back up, stop.
pub fn default_script() -> Vec<Step> {
    vec![
        Step::Forward,
        Step::Torque { value: 5.0 },
        Step::Wait { ms: 3_000 },
        Step::Torque { value: 0.0 },
        Step::Brake { position: 670 },
        Step::Wait { ms: 2_000 },
        Step::Brake { position: 288 },
        Step::Reverse,
        Step::Torque { value: 3.0 },
        Step::Wait { ms: 2_000 },
        Step::Torque { value: 0.0 },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajectoryOutcome {
    Completed,
    /// The Auto phase ended before `step` ran.
    Cancelled { step: usize },
    /// The actuator gave up on `step`.
    Aborted { step: usize },
}

#[derive(Clone)]
pub struct TrajectoryContext {
    pub executor: Arc<ActuatorExecutor>,
    pub bus: Arc<BusAdapter>,
    pub mode: SharedMode,
    pub epoch: u64,
    pub tick: Duration,
}

impl TrajectoryContext {
    fn active(&self) -> bool {
        self.mode.is_auto_epoch(self.epoch)
    }
}

pub fn spawn(script: Arc<[Step]>, context: TrajectoryContext) -> JoinHandle<TrajectoryOutcome> {
    tokio::spawn(async move { run(&script, &context).await })
}

pub async fn run(script: &[Step], context: &TrajectoryContext) -> TrajectoryOutcome {
    info!(steps = script.len(), epoch = context.epoch, "trajectory started");

    for (index, step) in script.iter().enumerate() {
        let proceed = match *step {
            Step::Wait { ms } => interruptible_sleep(context, Duration::from_millis(ms)).await,
            Step::Brake { position } => {
                if context.active() {
                    if let Err(err) =
                        context
                            .bus
                            .send_order(device::BRAKE, Order::BrakePosSet, Some(position))
                    {
                        warn!(%err, "brake_pos_set not sent");
                    }
                    true
                } else {
                    false
                }
            }
            Step::Forward | Step::Reverse | Step::Torque { .. } => {
                match actuate(context, *step).await {
                    Ok(true) => true,
                    Ok(false) => false,
                    Err(err) => {
                        warn!(step = index, %err, "trajectory aborted");
                        return TrajectoryOutcome::Aborted { step: index };
                    }
                }
            }
        };

        if !proceed {
            info!(step = index, "trajectory cancelled");
            return TrajectoryOutcome::Cancelled { step: index };
        }
    }

    info!("trajectory completed");
    TrajectoryOutcome::Completed
}

/// Write one actuator step if still in our Auto phase. The phase check and
/// the write happen under the same gate hold.
async fn actuate(context: &TrajectoryContext, step: Step) -> Result<bool, ActuatorError> {
    let mut session = context.executor.lock().await;
    if !context.active() {
        return Ok(false);
    }

    debug!(?step, "trajectory step");
    match step {
        Step::Forward => session.set_forward().await?,
        Step::Reverse => session.set_reverse().await?,
        Step::Torque { value } => session.set_torque(value).await?,
        Step::Brake { .. } | Step::Wait { .. } => return Ok(true),
    };
    Ok(true)
}

/// Sleep `total` in ticks, giving up as soon as the Auto phase ends.
async fn interruptible_sleep(context: &TrajectoryContext, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !context.active() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep(context.tick.min(deadline - now)).await;
    }
}
