use serde::{Deserialize, Serialize};

// Default transient write fault rate for the simulated motor controller.
const WRITE_FAULT_RATE_PERCENT: f32 = 0.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FaultInjectionStats {
    pub writes_attempted: u32,
    pub write_faults_injected: u32,
    pub configure_faults_injected: u32,
    pub forced_faults_injected: u32,
}

/// Configuration for fault injection behavior
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    pub write_fault_rate_percent: f32,
    /// Fail every `configure` call regardless of the rate.
    pub fail_configure: bool,
    pub seed: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            write_fault_rate_percent: WRITE_FAULT_RATE_PERCENT,
            fail_configure: false,
            seed: 0x1234_5678_9ABC_DEF0,
        }
    }
}

/// Probabilistic fault source for simulated drivers.
///
/// Deterministic for a given seed so failing runs can be replayed.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
    forced_failures: u32,
    rng_state: u64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::new_with_config(FaultInjectionConfig::default())
    }

    pub fn new_with_config(config: FaultInjectionConfig) -> Self {
        Self {
            config,
            stats: FaultInjectionStats::default(),
            forced_failures: 0,
            rng_state: config.seed,
        }
    }

    /// Decide whether the next write fails.
    pub fn write_fails(&mut self) -> bool {
        self.stats.writes_attempted += 1;

        if self.forced_failures > 0 {
            self.forced_failures -= 1;
            self.stats.forced_faults_injected += 1;
            return true;
        }
        if !self.config.enabled {
            return false;
        }

        let fails = self.random_float() < self.config.write_fault_rate_percent / 100.0;
        if fails {
            self.stats.write_faults_injected += 1;
        }
        fails
    }

    pub fn configure_fails(&mut self) -> bool {
        let fails = self.config.enabled && self.config.fail_configure;
        if fails {
            self.stats.configure_faults_injected += 1;
        }
        fails
    }

    /// Fail the next `count` writes unconditionally.
    pub fn force_failures(&mut self, count: u32) {
        self.forced_failures = count;
    }

    pub fn get_stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    fn next_random(&mut self) -> u64 {
        // Numerical Recipes LCG
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        (self.next_random() as f32) / (u64::MAX as f32)
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}
