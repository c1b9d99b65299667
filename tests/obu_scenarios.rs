mod common;

use common::{eventually, fast_config, Harness, MotorCommand, ScriptedMotor, WAIT};
use obu::fault::{FaultKind, FaultSource};
use obu::mode::Component;
use obu::protocol::device;
use obu::{DriveState, Mode, Order};
use std::time::Duration;

#[tokio::test]
async fn test_readiness_then_manual_by_default() {
    let (harness, log) = Harness::manual(fast_config()).await;
    let status = harness.handle.status();

    assert!(status.motor_ready);
    assert_eq!(status.readiness.as_slice(), &Component::ALL);
    assert_eq!(
        status.mode_sequence().collect::<Vec<_>>(),
        vec![Mode::Initialize, Mode::Start, Mode::Manual]
    );
    assert_eq!(log.commands()[0], MotorCommand::Configure);

    let brake = harness.sent_to(device::BRAKE);
    assert!(brake.contains(&("ready_ack".to_string(), 0)));
    assert!(brake.contains(&("start".to_string(), 0)));
    assert!(harness.sent_to(device::STEER).contains(&("start".to_string(), 0)));

    // Brake is started before steering.
    let traffic = harness.bus.traffic();
    let start = harness.registry.order_code("start").unwrap();
    let starts: Vec<&str> = traffic
        .iter()
        .filter(|frame| frame.order_code() == start)
        .filter_map(|frame| harness.registry.device_token(frame.device_code()))
        .collect();
    assert_eq!(starts, vec![device::BRAKE, device::STEER]);
}

#[tokio::test]
async fn test_missing_units_degrade_after_ceiling() {
    let mut config = fast_config();
    config.timing.readiness_ceiling_ms = 150;
    let (motor, log) = ScriptedMotor::new();
    let harness = Harness::start(config, Some(motor), Some(&log));

    assert!(harness.handle.wait_for_mode(Mode::Manual, WAIT).await);
    let status = harness.handle.status();
    assert_eq!(status.readiness.as_slice(), &[Component::Motor]);

    let timeouts: Vec<FaultSource> = harness
        .handle
        .faults()
        .iter()
        .filter(|fault| fault.kind == FaultKind::ReadinessTimeout)
        .map(|fault| fault.component)
        .collect();
    assert_eq!(timeouts, vec![FaultSource::Brake, FaultSource::Steer]);

    // Steering never confirmed, so it is not started.
    assert_eq!(harness.count_sent(device::BRAKE, Order::Start), 1);
    assert_eq!(harness.count_sent(device::STEER, Order::Start), 0);
}

#[tokio::test]
async fn test_late_readiness_reissues_start() {
    let mut config = fast_config();
    config.timing.readiness_ceiling_ms = 150;
    let (motor, log) = ScriptedMotor::new();
    let harness = Harness::start(config, Some(motor), Some(&log));
    harness.send(Order::SteerRdy, Some(1));
    assert!(harness.handle.wait_for_mode(Mode::Manual, WAIT).await);
    assert_eq!(harness.count_sent(device::BRAKE, Order::Start), 1);

    let status = harness.send_and_settle(Order::BrakeRdy, Some(1)).await;
    assert!(status.readiness.contains(&Component::Brake));
    assert_eq!(status.mode, Mode::Manual);
    assert_eq!(harness.count_sent(device::BRAKE, Order::Start), 2);
    assert_eq!(harness.count_sent(device::BRAKE, Order::ReadyAck), 1);
}

#[tokio::test]
async fn test_direction_applied_once_per_change() {
    let (harness, log) = Harness::manual(fast_config()).await;

    let status = harness.send_and_settle(Order::BoutonReverse, Some(0)).await;
    assert_eq!(status.state, Some(DriveState::Reverse));

    // Same direction through the other selector: no motor command.
    harness.send_and_settle(Order::BoutonOnOff, Some(0)).await;
    let status = harness.send_and_settle(Order::BoutonReverse, Some(1)).await;
    assert_eq!(status.state, Some(DriveState::Forward));

    // Manual entry drove forward once already.
    assert_eq!(log.count(MotorCommand::Reverse), 1);
    assert_eq!(log.count(MotorCommand::Forward), 2);
}

#[tokio::test]
async fn test_manual_defaults_to_forward_without_selector() {
    let (harness, log) = Harness::manual(fast_config()).await;
    let status = harness
        .handle
        .wait_for(|s| s.state.is_some(), WAIT)
        .await
        .expect("no drive state in Manual");

    assert_eq!(status.selectors.direction, None);
    assert_eq!(status.state, Some(DriveState::Forward));
    assert_eq!(log.count(MotorCommand::Forward), 1);

    // Forward selector on top of the default issues nothing new.
    let status = harness.send_and_settle(Order::BoutonReverse, Some(1)).await;
    assert_eq!(status.state, Some(DriveState::Forward));
    assert_eq!(log.count(MotorCommand::Forward), 1);
}

#[tokio::test]
async fn test_pedal_maps_to_torque_in_manual() {
    let (harness, log) = Harness::manual(fast_config()).await;

    let status = harness.send_and_settle(Order::AccelPedal, Some(1023)).await;
    assert_eq!(status.last_torque, Some(20.0));

    let status = harness.send_and_settle(Order::AccelPedal, Some(2000)).await;
    assert_eq!(status.last_torque, Some(20.0));
    assert_eq!(status.faults.malformed_inputs, 1);
    assert!(harness
        .handle
        .faults()
        .iter()
        .any(|fault| fault.component == FaultSource::Pedal && fault.kind == FaultKind::MalformedInput));

    let status = harness.send_and_settle(Order::AccelPedal, Some(0)).await;
    assert_eq!(status.last_torque, Some(0.0));
    assert_eq!(log.count(MotorCommand::Torque(20.0)), 1);
}

#[tokio::test]
async fn test_malformed_button_changes_nothing() {
    let (harness, log) = Harness::manual(fast_config()).await;

    let status = harness.send_and_settle(Order::BoutonReverse, Some(7)).await;
    assert_eq!(status.selectors.direction, None);
    assert_eq!(status.state, Some(DriveState::Forward));
    assert_eq!(status.faults.malformed_inputs, 1);
    assert_eq!(log.count(MotorCommand::Reverse), 0);
}

#[tokio::test]
async fn test_duplicate_pedal_suppressed() {
    let (harness, log) = Harness::manual(fast_config()).await;

    harness.send(Order::AccelPedal, Some(512));
    harness.send(Order::AccelPedal, Some(512));
    let status = harness
        .handle
        .wait_for(|s| s.dispatch.duplicates_suppressed >= 1, WAIT)
        .await
        .expect("duplicate not suppressed");
    assert_eq!(status.mode, Mode::Manual);
    assert_eq!(log.count(MotorCommand::Torque(512.0 * 20.0 / 1023.0)), 1);
}

#[tokio::test]
async fn test_auto_selector_starts_trajectory() {
    let (harness, log) = Harness::manual(fast_config()).await;

    harness.send(Order::BoutonAutoManu, Some(0));
    assert!(harness.handle.wait_for_mode(Mode::Auto, WAIT).await);
    assert!(eventually(|| log.count(MotorCommand::Torque(5.0)) == 1, WAIT).await);

    assert!(harness.sent_to(device::STEER).contains(&("steer_enable".to_string(), 1)));
    let auto_writes = log
        .calls()
        .into_iter()
        .filter(|call| call.command == MotorCommand::Torque(5.0))
        .all(|call| call.mode == Some(Mode::Auto));
    assert!(auto_writes);
}

#[tokio::test]
async fn test_leaving_auto_zeroes_torque_then_cancels_trajectory() {
    let (harness, log) = Harness::manual(fast_config()).await;
    harness.send(Order::BoutonAutoManu, Some(0));
    assert!(harness.handle.wait_for_mode(Mode::Auto, WAIT).await);
    assert!(eventually(|| log.count(MotorCommand::Torque(5.0)) == 1, WAIT).await);

    harness.send(Order::BoutonAutoManu, Some(1));
    assert!(harness.handle.wait_for_mode(Mode::Manual, Duration::from_millis(150)).await);

    // Give the worker a tick to notice, then poke the supervisor so it
    // republishes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.send(Order::SteerPosReal, Some(512));
    let status = harness
        .handle
        .wait_for(|s| !s.trajectory_active, Duration::from_millis(150))
        .await
        .expect("trajectory still running");
    assert_eq!(status.mode, Mode::Manual);

    let calls = log.calls();
    let drive = calls
        .iter()
        .position(|call| call.command == MotorCommand::Torque(5.0))
        .unwrap();
    let after = &calls[drive + 1..];
    assert_eq!(after[0].command, MotorCommand::Torque(0.0));
    assert_eq!(after[0].mode, Some(Mode::Auto));
    assert!(after[1..].iter().all(|call| call.mode == Some(Mode::Manual)));
    assert!(harness.sent_to(device::STEER).contains(&("steer_enable".to_string(), 0)));
}

#[tokio::test]
async fn test_park_in_auto_returns_to_manual() {
    let (harness, log) = Harness::manual(fast_config()).await;
    harness.send(Order::BoutonAutoManu, Some(0));
    assert!(harness.handle.wait_for_mode(Mode::Auto, WAIT).await);

    harness.send(Order::BoutonPark, Some(1));
    assert!(harness.handle.wait_for_mode(Mode::Manual, WAIT).await);

    assert!(harness.sent_to(device::BRAKE).contains(&("brake_pos_set".to_string(), 670)));
    assert_eq!(harness.handle.status().last_torque, Some(0.0));
    assert!(log.calls().iter().any(|c| c.command == MotorCommand::Torque(0.0)));
}

#[tokio::test]
async fn test_operator_cannot_skip_initialize() {
    let (harness, _log) = Harness::manual(fast_config()).await;

    assert!(harness.handle.request_mode(Mode::Start));
    assert!(harness.handle.request_mode(Mode::Initialize));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = harness.handle.status();
    assert_eq!(status.mode, Mode::Manual);
    assert_eq!(status.mode_sequence().count(), 3);
}

#[tokio::test]
async fn test_start_rejected_without_motor_init() {
    let mut config = fast_config();
    config.timing.error_settle_ms = 200;
    let (motor, log) = ScriptedMotor::failing_configure();
    let harness = Harness::start(config, Some(motor), Some(&log));
    harness.send(Order::BrakeRdy, Some(1));
    harness.send(Order::SteerRdy, Some(1));

    assert!(harness.handle.wait_for_mode(Mode::Error, WAIT).await);
    let status = harness.handle.status();
    assert!(!status.motor_ready);
    assert!(!status.visited(Mode::Manual));
    assert!(harness
        .handle
        .faults()
        .iter()
        .any(|f| f.component == FaultSource::Motor && f.kind == FaultKind::InitFailed));

    assert!(harness.handle.wait_for_mode(Mode::Restart, WAIT).await);
    assert!(harness.handle.wait_for_mode(Mode::Initialize, WAIT).await);
    assert!(harness.count_sent(device::BRAKE, Order::Stop) >= 1);
    assert!(harness.count_sent(device::STEER, Order::Restart) >= 1);
    assert!(eventually(|| log.count(MotorCommand::Configure) >= 2, WAIT).await);
}

#[tokio::test]
async fn test_exhaustion_forces_single_error() {
    let mut config = fast_config();
    config.timing.error_settle_ms = 1_000;
    let (harness, log) = Harness::manual(config).await;
    log.set_failing(true);

    harness.send(Order::AccelPedal, Some(800));
    assert!(harness.handle.wait_for_mode(Mode::Error, WAIT).await);
    assert_eq!(harness.handle.executor().error_requests(), 1);
    assert!(eventually(|| harness.count_sent(device::BRAKE, Order::Stop) >= 1, WAIT).await);
    assert!(log.count(MotorCommand::Stop) >= 1);
    assert_eq!(harness.handle.executor().error_requests(), 1);
}

#[tokio::test]
async fn test_failure_during_initialize_does_not_mute_later_escalation() {
    let mut config = fast_config();
    config.timing.error_settle_ms = 1_000;
    let (motor, log) = ScriptedMotor::new();
    let harness = Harness::start(config, Some(motor), Some(&log));

    // Park before any unit is ready: its zero-torque write gives up.
    log.fail_next(3);
    harness.send(Order::BoutonPark, Some(1));
    harness
        .handle
        .wait_for(|s| s.error_requests == 1, WAIT)
        .await
        .expect("park write never escalated");
    assert_eq!(harness.handle.mode(), Mode::Initialize);

    harness.send(Order::BrakeRdy, Some(1));
    harness.send(Order::SteerRdy, Some(1));
    assert!(harness.handle.wait_for_mode(Mode::Manual, WAIT).await);

    log.set_failing(true);
    harness.send(Order::AccelPedal, Some(800));
    assert!(harness.handle.wait_for_mode(Mode::Error, WAIT).await);
    assert_eq!(harness.handle.executor().error_requests(), 2);
}

#[tokio::test]
async fn test_trajectory_exhaustion_zeroes_torque_before_error() {
    let mut config = fast_config();
    config.timing.error_settle_ms = 1_000;
    let (harness, log) = Harness::manual(config).await;
    log.fail_torque(Some(5.0));

    harness.send(Order::BoutonAutoManu, Some(0));
    assert!(harness.handle.wait_for_mode(Mode::Error, WAIT).await);
    assert!(harness.handle.status().visited(Mode::Auto));
    assert!(eventually(|| log.count(MotorCommand::Stop) >= 1, WAIT).await);
    assert_eq!(harness.handle.executor().error_requests(), 1);

    let calls = log.calls();
    let drive: Vec<_> = calls
        .iter()
        .filter(|call| call.command == MotorCommand::Torque(5.0))
        .collect();
    assert_eq!(drive.len(), 3);
    assert!(drive.iter().all(|call| !call.ok && call.mode == Some(Mode::Auto)));

    let error = calls.iter().position(|c| c.mode == Some(Mode::Error)).unwrap();
    assert_eq!(calls[error - 1].command, MotorCommand::Torque(0.0));
    assert_eq!(calls[error - 1].mode, Some(Mode::Auto));
    assert!(calls[error - 1].ok);
    assert_eq!(calls[error].command, MotorCommand::Stop);
}

#[tokio::test]
async fn test_brake_enable_shuts_down() {
    let (harness, log) = Harness::manual(fast_config()).await;

    harness.send(Order::BrakeEnable, None);
    assert!(harness.handle.wait_for_mode(Mode::Off, WAIT).await);
    assert!(eventually(|| harness.handle.is_finished(), WAIT).await);

    assert_eq!(harness.count_sent(device::BRAKE, Order::Stop), 1);
    assert_eq!(harness.count_sent(device::STEER, Order::Stop), 1);
    assert_eq!(log.commands().last(), Some(&MotorCommand::Stop));

    // Nothing reaches a released bus.
    harness.send(Order::AccelPedal, Some(900));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(log.count(MotorCommand::Torque(900.0 * 20.0 / 1023.0)), 0);

    tokio::time::timeout(WAIT, harness.handle.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_handle_shutdown_from_auto() {
    let (harness, log) = Harness::manual(fast_config()).await;
    harness.send(Order::BoutonAutoManu, Some(0));
    assert!(harness.handle.wait_for_mode(Mode::Auto, WAIT).await);

    let status = harness.handle.subscribe();
    tokio::time::timeout(WAIT, harness.handle.shutdown())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.borrow().mode, Mode::Off);

    let calls = log.calls();
    let off = calls.iter().position(|c| c.mode == Some(Mode::Off)).unwrap();
    assert_eq!(calls[off - 1].command, MotorCommand::Torque(0.0));
    assert_eq!(calls[off - 1].mode, Some(Mode::Auto));
}
