//! The worker loop: each worker thread repeatedly drains its own queues
//! first, then widens its search outward — peers, the external queue,
//! ordered buckets — before finally going idle.

use crate::local_queue::LocalQueue;
use crate::scheduler::Scheduler;
use lightproc::LightProc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LONG_QUEUE_WAIT: Duration = Duration::from_secs(1);
const LONG_RUN: Duration = Duration::from_secs(1);

/// Entry point for a worker thread, spawned once per core by
/// [`Scheduler::service_start`]. Registers a peer slot, binds the thread
/// locally, and runs until the scheduler shuts down.
pub fn run(scheduler: Arc<Scheduler>) {
    let local = LocalQueue::new();
    let index = scheduler.register_peer(&local);
    scheduler.clone().bind_current_thread(index, local, || drain_loop(&scheduler, index));
}

fn drain_loop(scheduler: &Arc<Scheduler>, index: usize) {
    let config = *scheduler.config();
    let mut last_hang_check = Instant::now();

    loop {
        if scheduler.is_shutdown() {
            return;
        }

        if last_hang_check.elapsed() >= scheduler.hang_detector().check_interval() {
            scheduler.hang_detector().check();
            last_hang_check = Instant::now();
        }

        if let Some(task) = next_plain_task(scheduler, index, &config) {
            run_one(scheduler, task);
            continue;
        }

        // 8. a single pending ordered-spawn redirect (spawns made from
        // inside an already-running ordered task). The claim must stay
        // held for the whole task execution, not just the pop, so it's
        // handled inline here rather than threaded back through a
        // returned value.
        if let Some((claim, task)) = scheduler.ordered_spawns().try_claim() {
            scheduler.set_ordered_flag(true);
            run_one(scheduler, task);
            scheduler.set_ordered_flag(false);
            drop(claim);
            continue;
        }

        // 9. the named ordered-bucket set, rotating across buckets for
        // fairness.
        if let Some((claim, task)) = scheduler.ordered_set().try_take_next() {
            scheduler.set_ordered_flag(true);
            run_one(scheduler, task);
            scheduler.set_ordered_flag(false);
            drop(claim);
            continue;
        }

        idle(scheduler, index);
    }
}

/// Runs exactly one task end to end: arms the hang detector, reports a
/// long queue wait if the task sat around before this pop, runs it to
/// completion of one `poll`, reports a long run, then disarms.
fn run_one(scheduler: &Arc<Scheduler>, task: LightProc) {
    let call_site = task.metadata().call_site;
    if let Some(wait) = task.metadata().queue_wait() {
        if wait >= LONG_QUEUE_WAIT {
            tracing::warn!(call_site = call_site.0, wait_ms = wait.as_millis() as u64, "task queued longer than expected");
        }
    }

    scheduler.hang_detector().arm(call_site);
    let started = Instant::now();
    task.run();
    let ran_for = started.elapsed();
    scheduler.hang_detector().disarm();

    if ran_for >= LONG_RUN {
        tracing::warn!(call_site = call_site.0, run_ms = ran_for.as_millis() as u64, "task ran longer than expected");
    }
}

/// Implements steps 1-7 of the drain order — every source that yields a
/// task outright with no ongoing claim to hold. Steps 8-9 (the ordered
/// paths) are handled by the caller since they need their claim guard
/// kept alive across the task's execution.
fn next_plain_task(scheduler: &Arc<Scheduler>, index: usize, config: &crate::config::SchedulerConfig) -> Option<LightProc> {
    // 1. queue_all: full drain of the fan-out inbox before anything else.
    if let Some(peer) = scheduler.peer(index) {
        if let Some(task) = peer.queue_all.pop() {
            return Some(task);
        }
    }

    // 2. the worker's own spawn-slot / overflow queue.
    if let Some(task) = scheduler.with_local_queue(|local| local.pop()) {
        return Some(task);
    }

    // 3.-6. widen outward to peers.
    if let Some(task) = steal_from_peers(scheduler, index, config) {
        return Some(task);
    }

    // 7. the external queue, for spawns from threads not bound to any
    // worker in this scheduler.
    scheduler.with_local_queue(|local| local.steal_from_injector(scheduler.external_queue()))
}

/// Peer scan passes: try-lock steal-second, wait-lock batch steal, then
/// one spawn-slot steal, each scanning every other registered peer
/// starting just after `index` for fairness.
fn steal_from_peers(scheduler: &Arc<Scheduler>, index: usize, config: &crate::config::SchedulerConfig) -> Option<LightProc> {
    let peers_used = scheduler.peers_used();
    if peers_used <= 1 {
        return None;
    }

    // Pass A: opportunistic, skip a peer if its stealer is contended.
    for offset in 1..peers_used {
        let peer_index = (index + offset) % peers_used;
        if peer_index == index {
            continue;
        }
        if let Some(peer) = scheduler.peer(peer_index) {
            if let crossbeam_deque::Steal::Success(task) = peer.stealer.steal() {
                return Some(task);
            }
        }
    }

    // Pass B: batch steal, moving up to half the local cache target worth
    // of tasks into this worker's own queue, then take one of them.
    let batch_target = (config.spawns_pre_cache_target / 2).max(1);
    for offset in 1..peers_used {
        let peer_index = (index + offset) % peers_used;
        if peer_index == index {
            continue;
        }
        if let Some(peer) = scheduler.peer(peer_index) {
            if scheduler.steal_into_current(&peer.stealer, batch_target) > 0 {
                if let Some(task) = scheduler.with_local_queue(|local| local.pop()) {
                    return Some(task);
                }
            }
        }
    }

    None
}

/// Parks the worker on the shared idle condition variable until signalled
/// or a short timeout elapses, bounding how long a worker can sleep
/// through a missed wakeup during shutdown races.
fn idle(scheduler: &Arc<Scheduler>, index: usize) {
    if let Some(peer) = scheduler.peer(index) {
        peer.stat.idle();
    }
    scheduler.awake().fetch_sub(1, Ordering::AcqRel);
    let mut guard = scheduler.idle_cvar().enter(lightproc::proc_stack::Sample::UNKNOWN);
    if !scheduler.is_shutdown() {
        guard.wait(Some(Duration::from_millis(50)));
    }
    drop(guard);
    scheduler.awake().fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    #[test]
    fn idle_worker_with_nothing_queued_finds_no_task() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let local = LocalQueue::new();
        let index = scheduler.register_peer(&local);
        let config = *scheduler.config();
        scheduler.clone().bind_current_thread(index, local, || {
            assert!(next_plain_task(&scheduler, index, &config).is_none());
        });
    }
}
