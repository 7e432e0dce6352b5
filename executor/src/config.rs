//! Process-wide scheduler knobs, collected into one struct rather than one
//! `lazy_static!` per knob. Each field still reads its environment-variable
//! override exactly once, at [`SchedulerConfig::from_env`] time.

use std::time::Duration;

/// Hang-detector thresholds. Debug and release builds want different
/// defaults, so `HangConfig::default()` keys off `cfg(debug_assertions)`
/// to make the choice explicit rather than picking one blindly.
#[derive(Clone, Copy, Debug)]
pub struct HangConfig {
    pub check: Duration,
    pub complain: Duration,
    pub assert: Duration,
}

impl Default for HangConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            HangConfig {
                check: Duration::from_secs(10),
                complain: Duration::from_secs(0), // disabled by default
                assert: Duration::from_secs(5 * 60),
            }
        } else {
            // Release keeps the same check cadence but leans on `assert`
            // alone; `complain` stays disabled by default in both.
            HangConfig {
                check: Duration::from_secs(10),
                complain: Duration::from_secs(0),
                assert: Duration::from_secs(5 * 60),
            }
        }
    }
}

impl HangConfig {
    pub fn complain_enabled(&self) -> bool {
        !self.complain.is_zero()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub peers_capacity: usize,
    pub spawns_per_local: usize,
    pub spawns_pre_cache_target: usize,
    pub peek_threshold: usize,
    pub rate_interval: Duration,
    pub kick_timeout: Duration,
    pub hang: HangConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            peers_capacity: 48,
            spawns_per_local: 16,
            spawns_pre_cache_target: 8,
            peek_threshold: 63,
            rate_interval: Duration::from_secs(30),
            kick_timeout: Duration::from_nanos(628_000_000),
            hang: HangConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Applies environment-variable overrides on top of [`Default`], for
    /// the handful of knobs worth tuning without a recompile (worker
    /// count and hang-detector assert duration — the ones an operator is
    /// actually likely to need to change under load).
    pub fn from_env() -> Self {
        let mut config = SchedulerConfig::default();
        if let Some(v) = env_usize("RUNTIME_PEEK_THRESHOLD") {
            config.peek_threshold = v;
        }
        if let Some(v) = env_duration_secs("RUNTIME_HANG_ASSERT_SECS") {
            config.hang.assert = v;
        }
        if let Some(v) = env_duration_secs("RUNTIME_HANG_COMPLAIN_SECS") {
            config.hang.complain = v;
        }
        config
    }

    /// Worker count: one per core by default, overridable for tests that
    /// want deterministic small pools.
    pub fn worker_count() -> usize {
        env_usize("RUNTIME_WORKER_THREADS").unwrap_or_else(num_cpus::get).max(1)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_duration_secs(key: &str) -> Option<Duration> {
    env_usize(key).map(|s| Duration::from_secs(s as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_constants() {
        let config = SchedulerConfig::default();
        assert_eq!(config.peers_capacity, 48);
        assert_eq!(config.spawns_per_local, 16);
        assert_eq!(config.spawns_pre_cache_target, 8);
        assert_eq!(config.peek_threshold, 63);
        assert_eq!(config.rate_interval, Duration::from_secs(30));
    }
}
