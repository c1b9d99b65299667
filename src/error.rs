use thiserror::Error;

/// Failures while loading the address definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("section `{0}` missing from address definition")]
    MissingSection(&'static str),
    #[error("section `{section}` is not terminated by `}}`")]
    UnterminatedSection { section: &'static str },
    #[error("line {line} in `{section}` is not of the form `token = code`")]
    MalformedLine { section: &'static str, line: usize },
    #[error("`{value}` for token `{token}` is not a one-byte hex code")]
    InvalidCode { token: alloc::string::String, value: alloc::string::String },
    #[error("token `{token}` defined twice in `{section}`")]
    DuplicateToken { section: &'static str, token: alloc::string::String },
    #[error("code {code:#04x} assigned to both `{first}` and `{second}` in `{section}`")]
    DuplicateCode {
        section: &'static str,
        code: u8,
        first: alloc::string::String,
        second: alloc::string::String,
    },
    #[error("token `{0}` exceeds the maximum token length")]
    TokenTooLong(alloc::string::String),
}

/// Failures on the message bus send path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no wire address for device `{device}` / order `{order}`")]
    UnknownAddress {
        device: alloc::string::String,
        order: alloc::string::String,
    },
    #[error("transport is closed")]
    TransportClosed,
    #[error("transport failure: {0}")]
    Transport(alloc::string::String),
}

/// Failures reported by a motor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MotorError {
    #[error("motor write failed")]
    WriteFailed,
    #[error("motor is not configured")]
    NotConfigured,
    #[error("motor configuration failed")]
    ConfigurationFailed,
    #[error("motor controller unreachable")]
    Offline,
}

/// Failures surfaced by the actuator command executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("{command} failed after {attempts} attempts")]
    Exhausted { command: &'static str, attempts: u32 },
    #[error("driver error: {0}")]
    Driver(#[from] MotorError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

/// Construction-time failures of the on-board unit.
#[derive(Debug, Error)]
pub enum ObuError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
