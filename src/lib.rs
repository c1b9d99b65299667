//! # On-Board Unit Supervisor
//!
//! Supervisory control core for a vehicle on-board unit (OBU) sitting on a
//! CAN-style message bus together with a brake controller, a steering
//! controller and a locally attached traction motor.
//!
//! ## Features
//!
//! - **Priority bus dispatch**: inbound frames are classified by order token
//!   and served highest-priority first, FIFO within a class
//! - **Mode supervision**: Initialize, Start, Manual, Auto, Error, Restart and
//!   Off, with readiness tracking and operator selectors
//! - **Actuator execution**: serialized motor writes with retry, deadband and
//!   escalation to Error on exhaustion
//! - **Steering control**: bounded proportional loop between target and
//!   measured steering position
//! - **Simulated collaborators**: brake and steering units, a fault-injecting
//!   motor and an in-process loopback bus
//!
//! ## Quick Start
//!
//! ```no_run
//! use obu::{AddressRegistry, BusAdapter, LoopbackBus, Mode, ObuConfig, OnboardUnit, SimulatedMotor};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ObuConfig::default();
//! let registry = Arc::new(config.load_registry()?);
//! let bus = LoopbackBus::new();
//! let adapter = BusAdapter::on_loopback("OBU", registry, &bus)?;
//!
//! let motor = SimulatedMotor::new(config.actuator.max_torque);
//! let handle = OnboardUnit::new(config, adapter, Some(Box::new(motor)))?.spawn();
//! handle.wait_for_mode(Mode::Manual, Duration::from_secs(90)).await;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`registry`] - Device/order token to address code mapping
//! - [`protocol`] - Frames, payload codec, order catalog and priority classes
//! - [`transport`] - Transport seam and the loopback bus
//! - [`bus`] - Message bus adapter and dispatcher
//! - [`obu`] - Supervisory state machine
//! - [`executor`] - Actuator command executor
//! - [`steering`] - Steering control loop
//! - [`trajectory`] - Scripted Auto maneuver
//! - [`subsystems`] - Motor driver and the simulated brake/steering units
//! - [`bridge`] - Operator TCP bridge

#![warn(warnings)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod executor;
pub mod fault;
pub mod fault_injection;
pub mod mode;
pub mod obu;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod steering;
pub mod subsystems;
pub mod trajectory;
pub mod transport;

// Re-export main public types for convenience
pub use bus::{BusAdapter, Dispatcher};
pub use config::ObuConfig;
pub use error::{ActuatorError, BusError, ConfigError, MotorError, ObuError, RegistryError};
pub use mode::{DriveState, Mode, SharedMode};
pub use obu::{ObuHandle, OnboardUnit};
pub use protocol::{BusMessage, Frame, Order, PriorityClass};
pub use registry::AddressRegistry;
pub use status::ObuStatus;
pub use subsystems::{BrakeUnit, DeviceManager, MotorDriver, SimulatedMotor, SteerUnit};
pub use transport::{LoopbackBus, Transport};
