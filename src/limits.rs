use std::time::Duration;

/// Whether interrupt checks favor latency or throughput.
///
/// The mode only changes how often a long-running execution yields its
/// thread; it never changes correctness of cancellation or suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// Latency-sensitive embedding: yield frequently so maintenance work
    /// (garbage collection and the like) gets a safe point quickly.
    #[default]
    Interactive,
    /// Throughput-sensitive embedding: yield rarely.
    Batch,
}

/// Pool sizing and interrupt-check configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Baseline number of pool threads (default: 3).
    pub thread_limit: usize,
    /// Maximum number of threads allowed to sit idle (default: 3).
    pub idle_thread_limit: usize,
    /// Absolute cap on the thread limit. Capacity borrowing opens one slot
    /// per blocked thread, so the cap bounds thread growth when many
    /// workers suspend at once (default: 20).
    pub thread_cap: usize,
    /// Scheduling mode, selects the yield threshold.
    pub mode: SchedulingMode,
    /// How many interrupt checks pass between samples of the external
    /// event probe (default: 16).
    pub event_probe_interval: u32,
    /// Optional wall-clock budget for a whole script execution. This is an
    /// absolute deadline for the execution, not a per-check timeout.
    pub execution_deadline: Option<Duration>,
    /// Name prefix for pool threads.
    pub pool_name: String,
}

impl PoolConfig {
    /// Number of interrupt checks between cooperative yields.
    pub fn yield_threshold(&self) -> u32 {
        match self.mode {
            SchedulingMode::Interactive => 100,
            SchedulingMode::Batch => 1000,
        }
    }

    /// Panics on configurations that violate the pool's sizing invariants.
    pub fn validate(&self) {
        assert!(self.thread_limit >= 1, "thread_limit must be at least 1");
        assert!(
            self.thread_limit >= self.idle_thread_limit,
            "idle_thread_limit must not exceed thread_limit"
        );
        assert!(
            self.thread_cap >= self.thread_limit,
            "thread_cap must not be below thread_limit"
        );
        assert!(
            self.event_probe_interval >= 1,
            "event_probe_interval must be at least 1"
        );
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_limit: 3,
            idle_thread_limit: 3,
            thread_cap: 20,
            mode: SchedulingMode::Interactive,
            event_probe_interval: 16,
            execution_deadline: None,
            pool_name: "worker-dispatch".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_invariants() {
        let config = PoolConfig::default();
        config.validate();
        assert_eq!(config.thread_limit, 3);
        assert_eq!(config.thread_cap, 20);
        assert_eq!(config.yield_threshold(), 100);
    }

    #[test]
    fn batch_mode_yields_less_often() {
        let config = PoolConfig {
            mode: SchedulingMode::Batch,
            ..PoolConfig::default()
        };
        assert!(config.yield_threshold() > PoolConfig::default().yield_threshold());
    }

    #[test]
    #[should_panic(expected = "thread_cap")]
    fn cap_below_limit_is_rejected() {
        let config = PoolConfig {
            thread_limit: 10,
            idle_thread_limit: 3,
            thread_cap: 5,
            ..PoolConfig::default()
        };
        config.validate();
    }
}
