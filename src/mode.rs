use heapless::FnvIndexSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Operating mode of the on-board unit. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    Init = 0,
    Initialize = 1,
    Start = 2,
    Manual = 3,
    Auto = 4,
    Error = 5,
    Restart = 6,
    Off = 7,
}

impl Mode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Mode::Init,
            1 => Mode::Initialize,
            2 => Mode::Start,
            3 => Mode::Manual,
            4 => Mode::Auto,
            5 => Mode::Error,
            6 => Mode::Restart,
            _ => Mode::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Init => "init",
            Mode::Initialize => "initialize",
            Mode::Start => "start",
            Mode::Manual => "manual",
            Mode::Auto => "auto",
            Mode::Error => "error",
            Mode::Restart => "restart",
            Mode::Off => "off",
        }
    }

    /// Modes in which the vehicle is being driven.
    pub fn is_operational(self) -> bool {
        matches!(self, Mode::Manual | Mode::Auto)
    }
}

impl core::fmt::Display for Mode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Propulsion direction, subordinate to [`Mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveState {
    Forward,
    Reverse,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Brake,
    Steer,
    Motor,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Brake, Component::Steer, Component::Motor];

    /// Bus device token for the components that live on the bus.
    pub fn device(self) -> Option<&'static str> {
        match self {
            Component::Brake => Some(crate::protocol::device::BRAKE),
            Component::Steer => Some(crate::protocol::device::STEER),
            Component::Motor => None,
        }
    }
}

/// Components that confirmed readiness during the current Initialize phase.
#[derive(Debug, Clone, Default)]
pub struct ReadinessSet {
    members: FnvIndexSet<Component, 4>,
}

impl ReadinessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, component: Component) -> bool {
        // Capacity exceeds the number of components.
        self.members.insert(component).unwrap_or(false)
    }

    pub fn contains(&self, component: Component) -> bool {
        self.members.contains(&component)
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        Component::ALL.iter().all(|c| self.contains(*c))
    }

    pub fn to_vec(&self) -> heapless::Vec<Component, 3> {
        Component::ALL
            .iter()
            .copied()
            .filter(|c| self.contains(*c))
            .collect()
    }
}

struct ModeCell {
    mode: AtomicU8,
    auto_epoch: AtomicU64,
}

/// Mode readable from any task. Written only by the supervisor.
///
/// Every entry into Auto bumps the epoch, so a worker started for one Auto
/// phase can tell it apart from a later one even if it never observed the
/// mode leave Auto in between.
#[derive(Clone)]
pub struct SharedMode(Arc<ModeCell>);

impl SharedMode {
    pub fn new(mode: Mode) -> Self {
        Self(Arc::new(ModeCell {
            mode: AtomicU8::new(mode as u8),
            auto_epoch: AtomicU64::new(0),
        }))
    }

    pub fn get(&self) -> Mode {
        Mode::from_u8(self.0.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, mode: Mode) {
        if mode == Mode::Auto {
            self.0.auto_epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.0.mode.store(mode as u8, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.0.auto_epoch.load(Ordering::Acquire)
    }

    /// Still in the Auto phase identified by `epoch`.
    pub fn is_auto_epoch(&self, epoch: u64) -> bool {
        self.get() == Mode::Auto && self.epoch() == epoch
    }
}

impl Default for SharedMode {
    fn default() -> Self {
        Self::new(Mode::Init)
    }
}

/// One-shot readiness event per component carrying a success flag.
/// `None` until signaled.
pub struct ReadinessSignals {
    brake: Arc<watch::Sender<Option<bool>>>,
    steer: Arc<watch::Sender<Option<bool>>>,
    motor: Arc<watch::Sender<Option<bool>>>,
}

impl ReadinessSignals {
    pub fn new() -> Self {
        Self {
            brake: Arc::new(watch::Sender::new(None)),
            steer: Arc::new(watch::Sender::new(None)),
            motor: Arc::new(watch::Sender::new(None)),
        }
    }

    pub fn sender(&self, component: Component) -> Arc<watch::Sender<Option<bool>>> {
        match component {
            Component::Brake => Arc::clone(&self.brake),
            Component::Steer => Arc::clone(&self.steer),
            Component::Motor => Arc::clone(&self.motor),
        }
    }

    pub fn signal(&self, component: Component, ok: bool) {
        self.sender(component).send_replace(Some(ok));
    }

    pub fn value(&self, component: Component) -> Option<bool> {
        *self.sender(component).borrow()
    }

    pub fn subscribe(&self, component: Component) -> watch::Receiver<Option<bool>> {
        self.sender(component).subscribe()
    }

    pub fn reset(&self) {
        for component in Component::ALL {
            self.sender(component).send_replace(None);
        }
    }
}

impl Default for ReadinessSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Asynchronous request for a mode change, consumed by the supervisor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    pub mode: Mode,
    pub reason: &'static str,
}

impl ModeRequest {
    pub fn new(mode: Mode, reason: &'static str) -> Self {
        Self { mode, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roundtrips_through_cell() {
        let shared = SharedMode::default();
        for mode in [
            Mode::Init,
            Mode::Initialize,
            Mode::Start,
            Mode::Manual,
            Mode::Auto,
            Mode::Error,
            Mode::Restart,
            Mode::Off,
        ] {
            shared.set(mode);
            assert_eq!(shared.get(), mode);
        }
    }

    #[test]
    fn test_auto_epoch_advances_per_entry() {
        let shared = SharedMode::new(Mode::Manual);
        shared.set(Mode::Auto);
        let first = shared.epoch();
        assert!(shared.is_auto_epoch(first));

        shared.set(Mode::Manual);
        assert!(!shared.is_auto_epoch(first));

        shared.set(Mode::Auto);
        assert!(!shared.is_auto_epoch(first));
        assert!(shared.is_auto_epoch(first + 1));
    }

    #[test]
    fn test_readiness_set() {
        let mut set = ReadinessSet::new();
        assert!(set.insert(Component::Brake));
        assert!(!set.insert(Component::Brake));
        set.insert(Component::Steer);
        assert!(!set.is_complete());
        set.insert(Component::Motor);
        assert!(set.is_complete());
        assert_eq!(set.to_vec().as_slice(), &Component::ALL);
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_signals_reset() {
        let signals = ReadinessSignals::new();
        signals.signal(Component::Motor, false);
        assert_eq!(signals.value(Component::Motor), Some(false));
        assert_eq!(signals.value(Component::Brake), None);
        signals.reset();
        assert_eq!(signals.value(Component::Motor), None);
    }
}
