//! A one-shot, multi-waiter event. Distinct from
//! [`crate::condvar::ConditionVar`] in that it latches: once `set`, every
//! past, present, and future `wait` call returns immediately.

use crate::condvar::ConditionVar;
use lightproc::proc_stack::Sample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct Event {
    set: AtomicBool,
    cv: ConditionVar,
}

impl Event {
    pub fn new(sample: Sample) -> Self {
        Event {
            set: AtomicBool::new(false),
            cv: ConditionVar::new(sample),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.cv.signal(true);
    }

    /// Blocks until `set`, or `timeout` elapses (returns `false` on
    /// timeout).
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_set() {
            return true;
        }
        let mut guard = self.cv.enter(Sample::UNKNOWN);
        while !self.is_set() {
            match guard.wait(timeout) {
                crate::condvar::WaitResult::TimedOut => return self.is_set(),
                crate::condvar::WaitResult::Signaled => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait_is_immediate() {
        let event = Event::new(Sample::UNKNOWN);
        event.set();
        assert!(event.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn set_after_wait_wakes_waiter() {
        let event = Arc::new(Event::new(Sample::UNKNOWN));
        let e = event.clone();
        let handle = thread::spawn(move || e.wait(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(handle.join().unwrap());
    }
}
