//! Resource-trace accounting and the debug-only verification wrapper.
//!
//! A real deployment plugs in an external "resource-trace registry"; here
//! we keep the aggregation local to this crate (count + bytes per
//! logical allocation site) since the registry itself is an out-of-scope
//! collaborator.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::pool::{Pool, PoolDescriptor};

#[derive(Default)]
pub struct ResourceTrace {
    pub name: &'static str,
    pub count: AtomicI64,
    pub bytes: AtomicI64,
}

impl ResourceTrace {
    pub fn new(name: &'static str) -> Self {
        ResourceTrace {
            name,
            count: AtomicI64::new(0),
            bytes: AtomicI64::new(0),
        }
    }

    fn inc(&self, size: usize) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as i64, Ordering::Relaxed);
    }

    fn dec(&self, size: usize) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size as i64, Ordering::Relaxed);
    }
}

static GLOBAL_TRACKED_BYTES: AtomicI64 = AtomicI64::new(0);

pub fn global_tracked_bytes() -> i64 {
    GLOBAL_TRACKED_BYTES.load(Ordering::Relaxed)
}

const POISON_ALLOC: u8 = 0xC4;
const POISON_FREE: u8 = 0xD4;
const POISON_CAP: usize = 64 * 1024;

/// Wraps any `Pool` with resource-trace accounting and (debug builds
/// only) fill-on-map/fill-on-unmap poisoning that detects double-frees.
pub struct VerifiedPool<P: Pool> {
    inner: P,
    trace: ResourceTrace,
    live: Mutex<HashMap<usize, ()>>,
}

impl<P: Pool> VerifiedPool<P> {
    pub fn new(inner: P, name: &'static str) -> Self {
        VerifiedPool {
            inner,
            trace: ResourceTrace::new(name),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn trace(&self) -> &ResourceTrace {
        &self.trace
    }
}

impl<P: Pool> Pool for VerifiedPool<P> {
    fn describe(&self) -> PoolDescriptor {
        self.inner.describe()
    }

    fn map(&self) -> Option<NonNull<u8>> {
        let ptr = self.inner.map()?;
        let size = self.describe().size;
        self.trace.inc(size);
        GLOBAL_TRACKED_BYTES.fetch_add(size as i64, Ordering::Relaxed);
        self.live.lock().insert(ptr.as_ptr() as usize, ());

        #[cfg(debug_assertions)]
        unsafe {
            let fill = size.min(POISON_CAP);
            std::ptr::write_bytes(ptr.as_ptr(), POISON_ALLOC, fill);
        }
        Some(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        let key = ptr.as_ptr() as usize;
        let was_live = self.live.lock().remove(&key).is_some();
        debug_assert!(was_live, "double free or foreign pointer detected");

        #[cfg(debug_assertions)]
        {
            let size = self.describe().size;
            let fill = size.min(POISON_CAP);
            let existing = std::slice::from_raw_parts(ptr.as_ptr(), fill.min(1));
            debug_assert_ne!(existing.first(), Some(&POISON_FREE), "double free: already poisoned");
            std::ptr::write_bytes(ptr.as_ptr(), POISON_FREE, fill);
        }

        let size = self.describe().size;
        self.trace.dec(size);
        GLOBAL_TRACKED_BYTES.fetch_sub(size as i64, Ordering::Relaxed);
        self.inner.unmap(ptr);
    }
}

/// Escalation phases attempted by [`crate::oom::out_of_memory_die`]
/// before it finally dumps and aborts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpEscalation {
    UncapVsize,
    ReleaseVmemPoolPages,
    GiveUpOnStats,
}

pub fn dump_phases() -> [DumpEscalation; 3] {
    [
        DumpEscalation::UncapVsize,
        DumpEscalation::ReleaseVmemPoolPages,
        DumpEscalation::GiveUpOnStats,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolDescriptor;

    struct DummyPool {
        desc: PoolDescriptor,
    }

    impl Pool for DummyPool {
        fn describe(&self) -> PoolDescriptor {
            self.desc
        }
        fn map(&self) -> Option<NonNull<u8>> {
            let layout = std::alloc::Layout::from_size_align(self.desc.size, self.desc.align).unwrap();
            NonNull::new(unsafe { std::alloc::alloc(layout) })
        }
        unsafe fn unmap(&self, ptr: NonNull<u8>) {
            let layout = std::alloc::Layout::from_size_align(self.desc.size, self.desc.align).unwrap();
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    #[test]
    fn map_unmap_round_trips_to_zero() {
        let pool = VerifiedPool::new(
            DummyPool {
                desc: PoolDescriptor { size: 64, align: 8, phase: 0, trace: 1 },
            },
            "dummy",
        );
        let ptr = pool.map().unwrap();
        assert_eq!(pool.trace().count.load(Ordering::Relaxed), 1);
        unsafe { pool.unmap(ptr) };
        assert_eq!(pool.trace().count.load(Ordering::Relaxed), 0);
    }
}
