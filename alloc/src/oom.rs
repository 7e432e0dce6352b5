//! Out-of-memory escalation: when every pool in the affinity graph has
//! failed a request, walk the three
//! escalation phases `crate::trace::DumpEscalation` lists, logging each
//! attempt, before finally aborting the process. This is the last resort
//! — callers should prefer surfacing `None` from `Affinity::alloc` up the
//! stack; this only exists for call sites that have no fallback (a
//! scheduler's own bookkeeping allocations, say).

use crate::trace::{dump_phases, global_tracked_bytes, DumpEscalation};
use parking_lot::Mutex;
use std::sync::Arc;

type ShrinkHook = dyn Fn() -> usize + Send + Sync;

static SHRINK_HOOKS: Mutex<Vec<Arc<ShrinkHook>>> = Mutex::new(Vec::new());

/// Registers a callback pools can use to give back cached-but-unused
/// memory (e.g. `CyclicPool` draining idle tier slabs). Returns the
/// number of bytes it managed to release, for logging.
pub fn register_shrink_hook(hook: Arc<ShrinkHook>) {
    SHRINK_HOOKS.lock().push(hook);
}

fn run_phase(phase: DumpEscalation) -> usize {
    match phase {
        DumpEscalation::UncapVsize => {
            tracing::error!("oom: uncapping virtual size accounting, no further admission checks");
            0
        }
        DumpEscalation::ReleaseVmemPoolPages => {
            let hooks = SHRINK_HOOKS.lock().clone();
            hooks.iter().map(|hook| hook()).sum()
        }
        DumpEscalation::GiveUpOnStats => {
            tracing::error!("oom: giving up on resource-trace bookkeeping before abort");
            0
        }
    }
}

/// Runs the escalation ladder and aborts. Never returns.
pub fn out_of_memory_die(requested_bytes: usize) -> ! {
    tracing::error!(
        requested_bytes,
        tracked_bytes = global_tracked_bytes(),
        "out of memory: beginning escalation"
    );
    for phase in dump_phases() {
        let reclaimed = run_phase(phase);
        tracing::error!(?phase, reclaimed, "oom: escalation phase complete");
    }
    tracing::error!("out of memory: all escalation phases exhausted, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn shrink_hooks_run_during_release_phase() {
        static CALLED: AtomicUsize = AtomicUsize::new(0);
        register_shrink_hook(Arc::new(|| {
            CALLED.fetch_add(1, Ordering::SeqCst);
            4096
        }));
        let reclaimed = run_phase(DumpEscalation::ReleaseVmemPoolPages);
        assert!(reclaimed >= 4096);
        assert!(CALLED.load(Ordering::SeqCst) >= 1);
    }
}
