//! Mutual exclusion with level-ordering verification.
//!
//! A `Monitor` is a `parking_lot::Mutex<()>` plus a `level` used to assert
//! acquisition order: a thread holding a monitor of level `L` may not
//! enter another monitor of level `<= L`. The check only runs in debug
//! builds — asserted in debug, undefined behavior in release.

use crate::config::ContentionThresholds;
use lightproc::proc_stack::Sample;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// How strictly a monitor enforces real-time / non-real-time acquisition
/// ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Any acquisition by a real-time thread is reported.
    Strict,
    /// A non-real-time acquisition after a real-time one is reported as a
    /// possible priority inversion.
    AllowRt,
    /// Inversions are never reported.
    AllowPriorityInversion,
}

/// A named level for a [`Monitor`], used both for the level-ordering
/// assertion and for readable diagnostics (monitor "stereotypes").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Level(pub u32);

impl Level {
    pub const SCHEDULER: Level = Level(10);
    pub const ALLOCATOR: Level = Level(20);
    pub const TIMER: Level = Level(30);
    pub const LEAF: Level = Level(u32::MAX);
}

thread_local! {
    /// Per-thread stack of currently-held monitor levels, used only by the
    /// debug-build level-ordering assertion.
    static HELD_LEVELS: RefCell<Vec<(u64, u32)>> = RefCell::new(Vec::new());
    static IS_REALTIME: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Marks the current OS thread as real-time for the purposes of monitor
/// policy enforcement. Cooperates with an external scheduler policy
/// collaborator; this crate never sets it on its own.
pub fn mark_current_thread_realtime(is_rt: bool) {
    IS_REALTIME.with(|c| c.set(is_rt));
}

fn current_thread_is_realtime() -> bool {
    IS_REALTIME.with(|c| c.get())
}

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Mutual-exclusion monitor with level-ordered acquisition and contention
/// measurement. Infallible to create; `enter` never returns a recoverable
/// error.
pub struct Monitor {
    id: u64,
    inner: Mutex<()>,
    level: Level,
    policy: Policy,
    name: &'static str,
    contention: ContentionThresholds,
    ever_entered_by_rt: AtomicBool,
    last_holder: AtomicU64, // packs a Sample's raw usize, best-effort diagnostic only
}

impl Monitor {
    pub fn new(name: &'static str, level: Level, policy: Policy) -> Self {
        Monitor {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(()),
            level,
            policy,
            name,
            contention: ContentionThresholds::default(),
            ever_entered_by_rt: AtomicBool::new(false),
            last_holder: AtomicU64::new(0),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn is_acquired(&self) -> bool {
        self.inner.is_locked()
    }

    /// Acquires the monitor. If `try_only`, never blocks and returns
    /// `None` on contention; otherwise blocks until acquired (always
    /// `Some`).
    pub fn enter(&self, sample: Sample, try_only: bool) -> Option<Guard<'_>> {
        self.check_policy();

        if try_only {
            let guard = self.inner.try_lock()?;
            self.push_level();
            self.last_holder.store(sample.0 as u64, Ordering::Relaxed);
            return Some(Guard { monitor: self, _lock: guard });
        }

        let start = Instant::now();
        let guard = self.inner.lock();
        let waited = start.elapsed();
        let threshold = self.contention.threshold(current_thread_is_realtime());
        if waited >= threshold {
            let prev = self.last_holder.load(Ordering::Relaxed);
            warn!(
                monitor = self.name,
                waited_ms = waited.as_millis() as u64,
                prior_holder_site = prev,
                current_site = sample.0,
                "monitor contention exceeded threshold"
            );
        }
        self.last_holder.store(sample.0 as u64, Ordering::Relaxed);
        self.push_level();
        Some(Guard { monitor: self, _lock: guard })
    }

    fn check_policy(&self) {
        let is_rt = current_thread_is_realtime();
        match self.policy {
            Policy::Strict => {
                if is_rt {
                    warn!(monitor = self.name, "real-time thread acquiring Strict-policy monitor");
                }
            }
            Policy::AllowRt => {
                if is_rt {
                    self.ever_entered_by_rt.store(true, Ordering::Relaxed);
                } else if self.ever_entered_by_rt.load(Ordering::Relaxed) {
                    warn!(monitor = self.name, "possible priority inversion: non-RT acquisition after RT");
                }
            }
            Policy::AllowPriorityInversion => {}
        }
    }

    #[cfg_attr(not(debug_assertions), allow(unused))]
    fn push_level(&self) {
        #[cfg(debug_assertions)]
        HELD_LEVELS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(&(_, top_level)) = stack.last() {
                assert!(
                    top_level < self.level.0,
                    "monitor level violation: holding level {} while entering level {} ({})",
                    top_level,
                    self.level.0,
                    self.name
                );
            }
            stack.push((self.id, self.level.0));
        });
    }

    #[cfg_attr(not(debug_assertions), allow(unused))]
    fn pop_level(&self) {
        #[cfg(debug_assertions)]
        HELD_LEVELS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let popped = stack.pop();
            debug_assert_eq!(popped.map(|(id, _)| id), Some(self.id), "monitor release out of order");
        });
    }
}

/// RAII guard released on `Drop`, popping the debug level stack and
/// releasing the underlying lock.
pub struct Guard<'a> {
    monitor: &'a Monitor,
    _lock: parking_lot::MutexGuard<'a, ()>,
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) {
        self.monitor.pop_level();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_enter_fails_under_contention() {
        let m = Monitor::new("test", Level(1), Policy::AllowPriorityInversion);
        let _g = m.enter(Sample::UNKNOWN, false).unwrap();
        assert!(m.enter(Sample::UNKNOWN, true).is_none());
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore)]
    #[should_panic(expected = "monitor level violation")]
    fn level_violation_panics_in_debug() {
        let outer = Monitor::new("outer", Level(50), Policy::AllowPriorityInversion);
        let inner = Monitor::new("inner", Level(50), Policy::AllowPriorityInversion);
        let _g1 = outer.enter(Sample::UNKNOWN, false).unwrap();
        let _g2 = inner.enter(Sample::UNKNOWN, false).unwrap();
    }

    #[test]
    fn well_ordered_levels_do_not_panic() {
        let outer = Monitor::new("outer", Level::SCHEDULER, Policy::AllowPriorityInversion);
        let inner = Monitor::new("inner", Level::ALLOCATOR, Policy::AllowPriorityInversion);
        let _g1 = outer.enter(Sample::UNKNOWN, false).unwrap();
        let _g2 = inner.enter(Sample::UNKNOWN, false).unwrap();
    }
}
