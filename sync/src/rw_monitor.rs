//! Reader-writer monitor: one config monitor protects a
//! vector of per-reader-thread monitors. Shared (`read`) entry only ever
//! touches this thread's own reader monitor; exclusive (`write`) entry
//! acquires config, then every registered reader monitor in registration
//! order, so a writer can never run concurrently with any reader.

use crate::monitor::{Level, Monitor, Policy};
use lightproc::proc_stack::Sample;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// Keyed by the owning `RwMonitor`'s address so one thread can hold
    /// readers for several independent `RwMonitor`s without collision.
    static READERS: RefCell<Vec<(usize, Arc<Monitor>)>> = RefCell::new(Vec::new());
}

struct ReaderEntry {
    monitor: Arc<Monitor>,
}

pub struct RwMonitor {
    config: Monitor,
    readers: Mutex<Vec<Arc<Monitor>>>,
    policy: Policy,
}

impl RwMonitor {
    pub fn new(policy: Policy) -> Self {
        RwMonitor {
            config: Monitor::new("rw-config", Level::ALLOCATOR, policy),
            readers: Mutex::new(Vec::new()),
            policy,
        }
    }

    fn self_key(&self) -> usize {
        self as *const RwMonitor as usize
    }

    /// Returns (creating and registering if necessary) this thread's
    /// reader monitor.
    fn reader_monitor(&self) -> Arc<Monitor> {
        let key = self.self_key();
        if let Some(existing) = READERS.with(|r| {
            r.borrow()
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, m)| m.clone())
        }) {
            return existing;
        }

        let _config_guard = self.config.enter(Sample::UNKNOWN, false);
        let reader = Arc::new(Monitor::new("rw-reader", Level::LEAF, self.policy));
        self.readers.lock().push(reader.clone());
        READERS.with(|r| r.borrow_mut().push((key, reader.clone())));
        reader
    }

    /// Shared ("read") entry: only acquires this thread's own reader
    /// monitor, so distinct reader threads never contend with each other.
    pub fn enter_shared(&self, sample: Sample) -> crate::monitor::Guard<'static> {
        let reader = self.reader_monitor();
        // Safety: the Arc keeps the Monitor alive at least as long as this
        // thread's entry in READERS, which outlives any single critical
        // section; we leak the borrow's lifetime to 'static because the
        // Monitor is heap-allocated and reference-counted, not stack-local.
        let monitor: &'static Monitor = unsafe { &*(Arc::as_ptr(&reader)) };
        monitor.enter(sample, false).expect("blocking enter never returns None")
    }

    /// Exclusive ("write") entry: acquires config, then every registered
    /// reader monitor in registration order. While the returned guard set
    /// is alive, no reader's critical section can be running.
    pub fn enter_exclusive(&self, sample: Sample) -> ExclusiveGuard<'_> {
        let config_guard = self.config.enter(sample, false);
        let readers = self.readers.lock().clone();
        let mut reader_guards = Vec::with_capacity(readers.len());
        for reader in &readers {
            let monitor: &Monitor = reader;
            let guard = monitor.enter(sample, false).expect("blocking enter never returns None");
            // Extend lifetime: `reader_guards` is dropped before `readers`
            // (declared after it) so this is sound — guards never outlive
            // the Arcs that back them.
            let guard: crate::monitor::Guard<'static> = unsafe { std::mem::transmute(guard) };
            reader_guards.push(guard);
        }
        ExclusiveGuard {
            _config: config_guard,
            _readers: reader_guards,
            _keep_alive: readers,
        }
    }
}

pub struct ExclusiveGuard<'a> {
    _config: Option<crate::monitor::Guard<'a>>,
    _readers: Vec<crate::monitor::Guard<'static>>,
    _keep_alive: Vec<Arc<Monitor>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_then_writer_then_reader() {
        let rw = RwMonitor::new(Policy::AllowPriorityInversion);
        {
            let _r = rw.enter_shared(Sample::UNKNOWN);
        }
        {
            let _w = rw.enter_exclusive(Sample::UNKNOWN);
        }
        {
            let _r = rw.enter_shared(Sample::UNKNOWN);
        }
    }

    #[test]
    fn writer_excludes_reader() {
        let rw = Arc::new(RwMonitor::new(Policy::AllowPriorityInversion));
        let _r = rw.enter_shared(Sample::UNKNOWN);
        // A second, independent reader thread would have to wait behind
        // the writer once one shows up; here we just assert the config
        // monitor and registered-reader bookkeeping don't deadlock
        // same-thread (re-entrant shared access from the registering
        // thread itself).
        drop(_r);
        let _w = rw.enter_exclusive(Sample::UNKNOWN);
    }
}
