//! Per-task metadata carried alongside a [`crate::light_proc::LightProc`].
//!
//! This is deliberately small and `Copy`-ish: it rides along on every
//! spawn and gets stamped by the scheduler (queue time, owning thread) on
//! the hot path, so it must stay cheap to clone.

use std::time::Instant;

/// An opaque diagnostic token — a stand-in for a return-address-like call
/// site. Symbolization (turning this into a human string) is explicitly
/// an external collaborator's job; this crate only ever threads the raw
/// id through.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Sample(pub usize);

impl Sample {
    pub const UNKNOWN: Sample = Sample(0);

    #[inline]
    pub fn from_addr(addr: usize) -> Self {
        Sample(addr)
    }
}

impl Default for Sample {
    fn default() -> Self {
        Sample::UNKNOWN
    }
}

/// Metadata describing one [`LightProc`](crate::light_proc::LightProc)
/// instance: where it was created, when it was queued, and which thread
/// queued it.
#[derive(Clone, Debug, Default)]
pub struct ProcStack {
    /// The call site that spawned this task.
    pub call_site: Sample,
    /// Stamped by the scheduler when the task is enqueued; `None` until
    /// then. Used to compute queue-wait duration for the "long-queued"
    /// diagnostic.
    pub queue_time: Option<Instant>,
    /// The OS thread id that performed the enqueue, stamped alongside
    /// `queue_time`.
    pub thread_id: Option<std::thread::ThreadId>,
}

impl ProcStack {
    pub fn new(call_site: Sample) -> Self {
        ProcStack {
            call_site,
            queue_time: None,
            thread_id: None,
        }
    }

    pub fn with_call_site(mut self, call_site: Sample) -> Self {
        self.call_site = call_site;
        self
    }

    /// Stamps this stack as having just been enqueued on the current
    /// thread. Called once by the scheduler's `spawn` path.
    pub fn stamp_enqueue(&mut self) {
        self.queue_time = Some(Instant::now());
        self.thread_id = Some(std::thread::current().id());
    }

    /// Duration since `stamp_enqueue`, if it was ever stamped.
    pub fn queue_wait(&self) -> Option<std::time::Duration> {
        self.queue_time.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamping_sets_both_fields() {
        let mut stack = ProcStack::new(Sample::from_addr(0xdead));
        assert!(stack.queue_time.is_none());
        stack.stamp_enqueue();
        assert!(stack.queue_time.is_some());
        assert_eq!(stack.thread_id, Some(std::thread::current().id()));
    }
}
