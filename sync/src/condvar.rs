//! Condition variable bound to a monitor: `enter` holds the CV's own
//! monitor, and `wait` atomically releases it while the thread sleeps,
//! then re-acquires it on wake. `parking_lot::Condvar::wait` already
//! implements exactly this release/reacquire contract against a
//! `parking_lot::Mutex` guard, so we bind one to a [`Monitor`]'s inner
//! lock instead of hand-rolling a cookie-tuple wait primitive.

use crate::monitor::Level;
use lightproc::proc_stack::Sample;
use parking_lot::{Condvar as RawCondvar, Mutex, MutexGuard};
use std::time::Duration;

pub struct ConditionVar {
    lock: Mutex<()>,
    cond: RawCondvar,
    level: Level,
}

/// Held while waiting on (or otherwise protected by) a [`ConditionVar`].
pub struct CvGuard<'a> {
    guard: MutexGuard<'a, ()>,
    cv: &'a ConditionVar,
}

impl ConditionVar {
    pub fn new(_sample: Sample) -> Self {
        ConditionVar {
            lock: Mutex::new(()),
            cond: RawCondvar::new(),
            level: Level::LEAF,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Enters the CV's bound monitor. While held, `wait` can be called to
    /// atomically release and re-acquire it around the sleep.
    pub fn enter(&self, _sample: Sample) -> CvGuard<'_> {
        CvGuard {
            guard: self.lock.lock(),
            cv: self,
        }
    }

    pub fn try_enter(&self, _sample: Sample) -> Option<CvGuard<'_>> {
        self.lock.try_lock().map(|guard| CvGuard { guard, cv: self })
    }
}

impl<'a> CvGuard<'a> {
    /// Releases the monitor, blocks until signaled (or `timeout` elapses),
    /// then re-acquires the monitor before returning. Returns whether the
    /// wait timed out.
    pub fn wait(&mut self, timeout: Option<Duration>) -> WaitResult {
        match timeout {
            Some(d) => {
                let res = self.cv.cond.wait_for(&mut self.guard, d);
                if res.timed_out() {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Signaled
                }
            }
            None => {
                self.cv.cond.wait(&mut self.guard);
                WaitResult::Signaled
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

impl ConditionVar {
    /// Wakes one (`all = false`) or every (`all = true`) waiter. Every
    /// prior `wait` from a thread holding no monitor of its own returns
    /// exactly once after a `signal_all`.
    pub fn signal(&self, all: bool) {
        if all {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_all_wakes_every_waiter() {
        let cv = Arc::new(ConditionVar::new(Sample::UNKNOWN));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cv = cv.clone();
            handles.push(thread::spawn(move || {
                let mut guard = cv.enter(Sample::UNKNOWN);
                guard.wait(Some(Duration::from_secs(5)));
            }));
        }
        thread::sleep(Duration::from_millis(50));
        cv.signal(true);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn wait_with_timeout_reports_timeout() {
        let cv = ConditionVar::new(Sample::UNKNOWN);
        let mut guard = cv.enter(Sample::UNKNOWN);
        let result = guard.wait(Some(Duration::from_millis(20)));
        assert_eq!(result, WaitResult::TimedOut);
    }
}
