mod common;

use common::{MotorCommand, ScriptedMotor};
use obu::error::ActuatorError;
use obu::executor::{ActuatorExecutor, RetryPolicy, WriteOutcome};
use obu::fault::{FaultKind, FaultLog};
use obu::mode::ModeRequest;
use obu::Mode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn policy() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(1),
        deadband: 0.1,
    }
}

fn executor(
    motor: Option<ScriptedMotor>,
) -> (ActuatorExecutor, mpsc::UnboundedReceiver<ModeRequest>, obu::fault::SharedFaultLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let faults = FaultLog::shared();
    let motor = motor.map(|m| Box::new(m) as Box<dyn obu::MotorDriver>);
    (ActuatorExecutor::new(motor, policy(), tx, Arc::clone(&faults)), rx, faults)
}

#[tokio::test]
async fn test_deadband_drops_small_changes_but_never_zero() {
    let (motor, log) = ScriptedMotor::new();
    let (executor, _rx, _faults) = executor(Some(motor));

    assert_eq!(executor.set_torque(5.0).await, Ok(WriteOutcome::Applied));
    assert_eq!(executor.set_torque(5.05).await, Ok(WriteOutcome::Suppressed));
    assert_eq!(executor.set_torque(5.2).await, Ok(WriteOutcome::Applied));
    assert_eq!(executor.set_torque(0.0).await, Ok(WriteOutcome::Applied));
    assert_eq!(executor.set_torque(0.0).await, Ok(WriteOutcome::Applied));

    assert_eq!(
        log.commands(),
        vec![
            MotorCommand::Torque(5.0),
            MotorCommand::Torque(5.2),
            MotorCommand::Torque(0.0),
            MotorCommand::Torque(0.0),
        ]
    );
    assert_eq!(executor.last_torque(), Some(0.0));
}

#[tokio::test]
async fn test_transient_failure_is_retried_silently() {
    let (motor, log) = ScriptedMotor::new();
    let (executor, mut rx, faults) = executor(Some(motor));
    log.fail_next(2);

    assert_eq!(executor.set_forward().await, Ok(WriteOutcome::Applied));
    assert_eq!(log.count(MotorCommand::Forward), 3);
    assert!(rx.try_recv().is_err());
    assert_eq!(executor.error_requests(), 0);

    let faults = faults.lock().unwrap();
    assert_eq!(faults.history().len(), 2);
    assert!(faults.history().iter().all(|f| f.kind == FaultKind::Transient));
}

#[tokio::test]
async fn test_exhaustion_requests_error_once() {
    let (motor, log) = ScriptedMotor::new();
    let (executor, mut rx, _faults) = executor(Some(motor));
    log.set_failing(true);

    let first = executor.set_torque(3.0).await;
    assert_eq!(
        first,
        Err(ActuatorError::Exhausted { command: "set_torque", attempts: 3 })
    );
    assert!(executor.set_reverse().await.is_err());
    assert!(executor.stop().await.is_err());

    assert_eq!(rx.try_recv().map(|r| r.mode), Ok(Mode::Error));
    assert!(rx.try_recv().is_err());
    assert_eq!(executor.error_requests(), 1);
    assert_eq!(log.count(MotorCommand::Torque(3.0)), 3);

    // A later phase may escalate again.
    executor.rearm();
    assert!(executor.set_forward().await.is_err());
    assert_eq!(rx.try_recv().map(|r| r.mode), Ok(Mode::Error));
    assert_eq!(executor.error_requests(), 2);
}

#[tokio::test]
async fn test_absent_motor_is_a_no_op() {
    let (executor, mut rx, _faults) = executor(None);
    assert!(!executor.has_motor());
    assert_eq!(executor.set_torque(4.0).await, Ok(WriteOutcome::Absent));
    assert_eq!(executor.stop().await, Ok(WriteOutcome::Absent));
    assert_eq!(executor.last_torque(), None);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_session_serializes_writers() {
    let (motor, log) = ScriptedMotor::new();
    let (executor, _rx, _faults) = executor(Some(motor));
    let executor = Arc::new(executor);

    let mut session = executor.lock().await;
    let contender = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.set_torque(7.0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(log.commands().is_empty());

    session.set_torque(2.0).await.unwrap();
    drop(session);

    assert_eq!(contender.await.unwrap(), Ok(WriteOutcome::Applied));
    assert_eq!(log.commands(), vec![MotorCommand::Torque(2.0), MotorCommand::Torque(7.0)]);
}
