//! Process-wide configuration knobs, collected into one struct instead of
//! one `lazy_static!` per knob, with the same env-var-overrides-default
//! contract.

use std::time::Duration;

/// Monitor contention thresholds, split by build profile and by whether
/// the acquiring thread is real-time.
#[derive(Clone, Copy, Debug)]
pub struct ContentionThresholds {
    pub debug_rt: Duration,
    pub debug_non_rt: Duration,
    pub release_rt: Duration,
    pub release_non_rt: Duration,
}

impl Default for ContentionThresholds {
    fn default() -> Self {
        ContentionThresholds {
            debug_rt: Duration::from_millis(10),
            debug_non_rt: Duration::from_millis(100),
            release_rt: Duration::from_millis(10),
            release_non_rt: Duration::from_millis(10),
        }
    }
}

impl ContentionThresholds {
    pub fn threshold(&self, is_rt: bool) -> Duration {
        if cfg!(debug_assertions) {
            if is_rt {
                self.debug_rt
            } else {
                self.debug_non_rt
            }
        } else if is_rt {
            self.release_rt
        } else {
            self.release_non_rt
        }
    }
}

/// Timer queue tuning.
#[derive(Clone, Copy, Debug)]
pub struct TimerConfig {
    pub activate_slack: Duration,
    pub retry_default: Duration,
    pub retry_margin: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            activate_slack: Duration::from_micros(50),
            retry_default: Duration::from_secs(7),
            retry_margin: Duration::from_millis(100),
        }
    }
}

/// Pooled monitor table sizing: scales as `(2*cores)^2`, computed rather
/// than hard-coded, floored at a 4096-entry table and rounded up to a
/// power of two.
pub fn pooled_monitor_table_size() -> usize {
    let cores = num_cpus::get().max(1);
    let raw = (2 * cores).pow(2);
    raw.max(4096).next_power_of_two()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncConfig {
    pub contention: ContentionThresholds,
    pub timer: TimerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_table_is_at_least_4096() {
        assert!(pooled_monitor_table_size() >= 4096);
        assert!(pooled_monitor_table_size().is_power_of_two());
    }
}
