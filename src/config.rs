//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields the stock vehicle setup:
//!
//! ```toml
//! device_name = "OBU"
//!
//! [actuator]
//! max_torque = 20.0
//! retry_limit = 3
//!
//! [timing]
//! error_settle_ms = 3000
//!
//! [[trajectory]]
//! op = "forward"
//!
//! [[trajectory]]
//! op = "torque"
//! value = 5.0
//! ```

use crate::error::{ConfigError, ObuError};
use crate::registry::AddressRegistry;
use crate::trajectory::{self, Step};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObuConfig {
    pub device_name: String,
    /// Address definition file. The embedded definition is used when unset.
    pub registry_path: Option<PathBuf>,
    pub actuator: ActuatorConfig,
    pub steering: SteeringConfig,
    pub timing: TimingConfig,
    pub brake: BrakeConfig,
    pub trajectory: Vec<Step>,
}

impl Default for ObuConfig {
    fn default() -> Self {
        Self {
            device_name: crate::protocol::device::OBU.to_string(),
            registry_path: None,
            actuator: ActuatorConfig::default(),
            steering: SteeringConfig::default(),
            timing: TimingConfig::default(),
            brake: BrakeConfig::default(),
            trajectory: trajectory::default_script(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub max_torque: f32,
    /// Raw pedal reading that maps to `max_torque`.
    pub pedal_full_scale: u64,
    pub torque_deadband: f32,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            max_torque: 20.0,
            pedal_full_scale: 1023,
            torque_deadband: 0.1,
            retry_limit: 3,
            retry_delay_ms: 20,
        }
    }
}

impl ActuatorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringConfig {
    pub kp: f64,
    pub max_step: f64,
    pub tick_ms: u64,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        Self {
            kp: 0.8,
            max_step: 30.0,
            tick_ms: 50,
        }
    }
}

impl SteeringConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub readiness_poll_ms: u64,
    pub readiness_ceiling_ms: u64,
    pub start_settle_ms: u64,
    pub error_settle_ms: u64,
    pub restart_settle_ms: u64,
    pub trajectory_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readiness_poll_ms: 100,
            readiness_ceiling_ms: 60_000,
            start_settle_ms: 200,
            error_settle_ms: 3_000,
            restart_settle_ms: 1_000,
            trajectory_tick_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn readiness_ceiling(&self) -> Duration {
        Duration::from_millis(self.readiness_ceiling_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn error_settle(&self) -> Duration {
        Duration::from_millis(self.error_settle_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn trajectory_tick(&self) -> Duration {
        Duration::from_millis(self.trajectory_tick_ms)
    }
}

/// Brake actuator positions in raw potentiometer counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BrakeConfig {
    pub pressed_position: u64,
    pub released_position: u64,
}

impl Default for BrakeConfig {
    fn default() -> Self {
        Self {
            pressed_position: 670,
            released_position: 288,
        }
    }
}

impl ObuConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.device_name.is_empty() {
            return invalid("device_name", "must not be empty");
        }
        if !(self.actuator.max_torque > 0.0) {
            return invalid("actuator.max_torque", "must be positive");
        }
        if self.actuator.pedal_full_scale == 0 {
            return invalid("actuator.pedal_full_scale", "must be positive");
        }
        if !(self.actuator.torque_deadband >= 0.0) {
            return invalid("actuator.torque_deadband", "must not be negative");
        }
        if self.actuator.retry_limit == 0 {
            return invalid("actuator.retry_limit", "must be at least 1");
        }
        if !(self.steering.max_step > 0.0) {
            return invalid("steering.max_step", "must be positive");
        }
        if self.steering.tick_ms == 0 {
            return invalid("steering.tick_ms", "must be positive");
        }
        if self.timing.readiness_poll_ms == 0 {
            return invalid("timing.readiness_poll_ms", "must be positive");
        }
        if self.timing.trajectory_tick_ms == 0 {
            return invalid("timing.trajectory_tick_ms", "must be positive");
        }
        Ok(())
    }

    /// Address registry named by `registry_path`, or the embedded default.
    pub fn load_registry(&self) -> Result<AddressRegistry, ObuError> {
        match &self.registry_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(ConfigError::from)?;
                Ok(AddressRegistry::parse(&text)?)
            }
            None => Ok(AddressRegistry::load_default()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = ObuConfig::from_toml("").unwrap();
        assert_eq!(config.device_name, "OBU");
        assert_eq!(config.actuator.retry_limit, 3);
        assert_eq!(config.timing.readiness_ceiling(), Duration::from_secs(60));
        assert_eq!(config.brake.pressed_position, 670);
        assert_eq!(config.trajectory, trajectory::default_script());
    }

    #[test]
    fn test_partial_override() {
        let config = ObuConfig::from_toml(
            "[actuator]\nmax_torque = 10.0\n\n[timing]\nerror_settle_ms = 50\n",
        )
        .unwrap();
        assert_eq!(config.actuator.max_torque, 10.0);
        assert_eq!(config.actuator.pedal_full_scale, 1023);
        assert_eq!(config.timing.error_settle(), Duration::from_millis(50));
    }

    #[test]
    fn test_trajectory_from_toml() {
        let config = ObuConfig::from_toml(
            "[[trajectory]]\nop = \"reverse\"\n\n[[trajectory]]\nop = \"wait\"\nms = 250\n",
        )
        .unwrap();
        assert_eq!(config.trajectory, vec![Step::Reverse, Step::Wait { ms: 250 }]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ObuConfig::default();
        config.actuator.retry_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "actuator.retry_limit", .. })
        ));

        let mut config = ObuConfig::default();
        config.timing.trajectory_tick_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ObuConfig::default();
        config.actuator.torque_deadband = -0.5;
        assert!(config.validate().is_err());

        assert!(matches!(
            ObuConfig::from_toml("[actuator]\nmax_torque = \"lots\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_default_registry_loads() {
        let registry = ObuConfig::default().load_registry().unwrap();
        assert!(registry.address("BRAKE", "brake_pos_set").is_some());
    }
}
