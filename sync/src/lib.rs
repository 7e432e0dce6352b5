//! Monitors, condition variables, the thread-local service registry, and
//! the timer queue: the lock-free concurrency primitives the scheduler
//! and allocator crates depend on.

pub mod condvar;
pub mod config;
pub mod error;
pub mod event;
pub mod monitor;
pub mod pooled;
pub mod registry;
pub mod rw_monitor;
pub mod timer;

pub use condvar::ConditionVar;
pub use error::CoreError;
pub use event::Event;
pub use monitor::{Level, Monitor, Policy};
pub use registry::ServiceRegistry;
pub use rw_monitor::RwMonitor;
pub use timer::TimerQueue;

use lightproc::proc_stack::Sample;

/// Builds a fresh, unpooled monitor at the given level and policy.
pub fn monitor_new(_sample: Sample, level: Level, policy: Policy) -> Monitor {
    Monitor::new("monitor", level, policy)
}

/// Returns this owner's slot in the static pooled table.
pub fn monitor_pool_new(owner_ptr: usize, policy: Policy) -> &'static Monitor {
    pooled::monitor_for(owner_ptr, policy)
}

/// A named, pre-registered monitor level for a well-known subsystem.
pub fn monitor_static_new(_sample: Sample, stereotype: Level, policy: Policy) -> Monitor {
    Monitor::new("static", stereotype, policy)
}

/// Builds a fresh reader-writer monitor.
pub fn rw_monitor_new(_sample: Sample, policy: Policy) -> RwMonitor {
    RwMonitor::new(policy)
}

/// Builds a fresh condition variable.
pub fn condition_var_new(sample: Sample) -> ConditionVar {
    ConditionVar::new(sample)
}

/// Builds a fresh one-shot event.
pub fn event_new(sample: Sample) -> Event {
    Event::new(sample)
}
