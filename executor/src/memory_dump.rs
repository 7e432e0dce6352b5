//! Periodic memory-dump watchdog: on an interval, or sooner if tracked
//! bytes jump by the configured watermark ratio since the last dump,
//! snapshot resource-trace totals. Reentry is prevented by a nesting
//! counter so a slow dump doesn't overlap the next tick.
//!
//! Periodic jobs like this one and the hang check are natural timer-queue
//! consumers; we run this one as its own dedicated thread with a
//! sleep-based cadence rather than threading it through a shared
//! `TimerQueue` instance, since a process-wide `Scheduler` doesn't
//! otherwise own one — see DESIGN.md.

use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_secs(30);
const MIN_INTERVAL: Duration = Duration::from_secs(5);
const WATERMARK_RATIO_NUM: i64 = 1;
const WATERMARK_RATIO_DEN: i64 = 8;
const FLOOR_BYTES: i64 = 1024 * 1024 * 1024;

static NESTING: AtomicUsize = AtomicUsize::new(0);

fn should_dump(last_dumped: i64, current: i64) -> bool {
    if current < FLOOR_BYTES {
        return false;
    }
    let growth = current - last_dumped;
    growth * WATERMARK_RATIO_DEN >= last_dumped.max(1) * WATERMARK_RATIO_NUM
}

fn dump_once(last_dumped: &AtomicI64) {
    if NESTING.fetch_add(1, Ordering::AcqRel) > 0 {
        NESTING.fetch_sub(1, Ordering::AcqRel);
        return;
    }
    let current = runtime_alloc::trace::global_tracked_bytes();
    tracing::info!(tracked_bytes = current, "resource-trace snapshot");
    last_dumped.store(current, Ordering::Release);
    NESTING.fetch_sub(1, Ordering::AcqRel);
}

/// Spawns the watchdog thread for `scheduler`. Exits once
/// `scheduler.is_shutdown()` observes the shutdown flag, checked every
/// [`MIN_INTERVAL`] so shutdown latency stays bounded regardless of the
/// main 30s cadence.
pub fn spawn_watcher(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("runtime-memory-dump".into())
        .spawn(move || {
            let last_dumped = AtomicI64::new(0);
            let mut waited = Duration::ZERO;
            while !scheduler.is_shutdown() {
                std::thread::sleep(MIN_INTERVAL);
                waited += MIN_INTERVAL;
                let current = runtime_alloc::trace::global_tracked_bytes();
                if waited >= INTERVAL || should_dump(last_dumped.load(Ordering::Acquire), current) {
                    dump_once(&last_dumped);
                    waited = Duration::ZERO;
                }
            }
        })
        .expect("failed to spawn memory-dump watcher thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_floor_never_triggers() {
        assert!(!should_dump(0, FLOOR_BYTES - 1));
    }

    #[test]
    fn watermark_growth_triggers_above_floor() {
        let last = FLOOR_BYTES;
        let current = last + last / 8 + 1;
        assert!(should_dump(last, current));
    }

    #[test]
    fn small_growth_does_not_trigger() {
        let last = FLOOR_BYTES;
        let current = last + 1;
        assert!(!should_dump(last, current));
    }
}
