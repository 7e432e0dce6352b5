//! Per-worker queue state (`LocalQueue`/`LocalStat`).
//!
//! A worker's local queue is conceptually a fixed-size spawn-slot ring
//! plus overflow lists (`queue`, `queue_all`). `crossbeam_deque::Worker`
//! already *is* exactly that shape under the hood — a growable lock-free
//! ring buffer that the owning thread pushes/pops and any thread can
//! steal from — so rather than hand-roll the ring ourselves (naively
//! translating raw `next_`-linked structures into unsafe Rust is exactly
//! the kind of thing worth avoiding) we reuse it for the spawn slots +
//! `queue` overflow, and keep `queue_all` as its own structure since it
//! has different semantics: any thread may push into *any* peer's
//! `queue_all` (for `spawn_all` fan-out), and the owner drains it
//! completely every pass rather than stealing from it a few at a time.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_queue::SegQueue;
use lightproc::LightProc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-worker spawn counters. `spawns` doubles a
/// target threshold each time it's crossed, so bursts of spawns only pay
/// for one peer-wakeup signal per doubling instead of one per spawn.
#[derive(Debug)]
pub struct LocalStat {
    spawns: AtomicUsize,
    signal_threshold: AtomicUsize,
}

impl Default for LocalStat {
    fn default() -> Self {
        LocalStat {
            spawns: AtomicUsize::new(0),
            signal_threshold: AtomicUsize::new(1),
        }
    }
}

impl LocalStat {
    /// Records one spawn. Returns `true` exactly when this spawn crossed
    /// the current doubling threshold — the caller's cue to consider
    /// waking an idle peer.
    pub fn record_spawn(&self) -> bool {
        let count = self.spawns.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = self.signal_threshold.load(Ordering::Acquire);
        if count >= threshold {
            self.signal_threshold.store(threshold.saturating_mul(2), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Resets both counters; called when a worker goes idle so the next
    /// burst starts signalling from the first spawn again.
    pub fn idle(&self) {
        self.spawns.store(0, Ordering::Release);
        self.signal_threshold.store(1, Ordering::Release);
    }
}

/// The owning-thread-only side of one worker's queue: the spawn-slot ring
/// plus `queue` overflow, collapsed into a single `crossbeam_deque::Worker`
/// (push/pop are `&self` but not thread-safe across callers by design —
/// only the owning worker thread ever touches this type, kept in its own
/// thread-local `WorkerContext`, never shared behind an `Arc`).
pub struct LocalQueue {
    worker: Worker<LightProc>,
}

impl LocalQueue {
    pub fn new() -> Self {
        LocalQueue { worker: Worker::new_fifo() }
    }

    pub fn stealer(&self) -> Stealer<LightProc> {
        self.worker.stealer()
    }

    /// Owner-only push (spawn-slot / overflow push).
    pub fn push(&self, task: LightProc) {
        self.worker.push(task);
    }

    /// Owner-only pop.
    pub fn pop(&self) -> Option<LightProc> {
        self.worker.pop()
    }

    /// Steals a batch from `injector` straight into this queue and pops
    /// one off the top, in one step (the external-queue steal path).
    /// `Worker` stays private to this module; this is the
    /// one place that needs to hand it to crossbeam as a steal target.
    pub fn steal_from_injector(&self, injector: &Injector<LightProc>) -> Option<LightProc> {
        loop {
            match injector.steal_batch_and_pop(&self.worker) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        LocalQueue::new()
    }
}

/// A peer's view as seen by every other worker: a stealer handle, the
/// `queue_all` fan-out inbox any thread may push into (`spawn_all` pushes
/// one entry per peer), and the shared counters needed
/// to decide whether to wake it.
pub struct PeerHandle {
    pub stealer: Stealer<LightProc>,
    pub queue_all: SegQueue<LightProc>,
    pub stat: LocalStat,
}

impl PeerHandle {
    pub fn new(stealer: Stealer<LightProc>) -> Self {
        PeerHandle {
            stealer,
            queue_all: SegQueue::new(),
            stat: LocalStat::default(),
        }
    }
}

/// The external queue for foreign-thread spawns (spawns from threads
/// that aren't bound to any worker in this scheduler). An `Injector` is
/// crossbeam's MPMC unbounded queue designed
/// exactly for this many-producers/many-consumers-stealing-in-batches
/// role.
pub type ExternalQueue = Injector<LightProc>;

pub fn steal_batch_into(stealer: &Stealer<LightProc>, dest: &LocalQueue, max: usize) -> usize {
    let mut moved = 0;
    while moved < max {
        match stealer.steal() {
            Steal::Success(task) => {
                dest.push(task);
                moved += 1;
            }
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_threshold_doubles_each_crossing() {
        // Threshold starts at 1 and doubles every time `spawns` catches up
        // to it, so signals land on spawn counts 1, 2, 4, 8, ... with a
        // quiet stretch of non-signalling spawns in between each pair.
        let stat = LocalStat::default();
        assert!(stat.record_spawn()); // count 1 >= threshold 1 -> signal, threshold -> 2
        assert!(stat.record_spawn()); // count 2 >= threshold 2 -> signal, threshold -> 4
        assert!(!stat.record_spawn()); // count 3 < threshold 4
        assert!(stat.record_spawn()); // count 4 >= threshold 4 -> signal, threshold -> 8
    }

    #[test]
    fn idle_resets_counters() {
        let stat = LocalStat::default();
        stat.record_spawn();
        stat.idle();
        assert!(stat.record_spawn());
    }

    #[test]
    fn fresh_peer_handle_has_empty_fanout_inbox() {
        let queue = LocalQueue::new();
        let peer = PeerHandle::new(queue.stealer());
        assert!(peer.queue_all.pop().is_none());
    }
}
