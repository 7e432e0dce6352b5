//! Lock-free small-object pool ("NodeSmallPool"): node hand-out and
//! reclaim go through CAS loops on a per-slab bump counter
//! and Treiber-stack free list. Slab *lifecycle* events (attaching a
//! fresh slab, retiring a drained one) are comparatively rare, so those
//! go through a short-held lock over the pool's slab roster — the same
//! hybrid shape `sync::rw_monitor` and `sync::timer` already use
//! elsewhere in this crate.

use crate::pool::{Pool, PoolDescriptor};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlabState {
    /// Currently receiving bump allocations.
    Attached,
    /// Full, but has freed nodes worth recycling.
    LowFrag,
    /// Fully drained, awaiting release to the parent pool.
    Free,
}

struct SlabHeadSmall {
    bump: AtomicUsize,
    capacity: usize,
    live: AtomicUsize,
    free_head: AtomicPtr<u8>,
    state: Mutex<SlabState>,
    base: usize,
}

pub struct NodeSmallPool {
    parent: Arc<dyn Pool>,
    node_size: usize,
    slab_size: usize,
    header_nodes: usize,
    current: AtomicPtr<SlabHeadSmall>,
    roster: Mutex<Vec<NonNull<SlabHeadSmall>>>,
    descriptor: PoolDescriptor,
}

unsafe impl Send for NodeSmallPool {}
unsafe impl Sync for NodeSmallPool {}

impl NodeSmallPool {
    pub fn new(parent: Arc<dyn Pool>, node_size: usize) -> Self {
        assert!(node_size >= std::mem::size_of::<usize>());
        let slab_size = parent.describe().size;
        assert!(slab_size.is_power_of_two());
        let header_nodes = (std::mem::size_of::<SlabHeadSmall>() + node_size - 1) / node_size;
        NodeSmallPool {
            parent,
            node_size,
            slab_size,
            header_nodes,
            current: AtomicPtr::new(std::ptr::null_mut()),
            roster: Mutex::new(Vec::new()),
            descriptor: PoolDescriptor { size: node_size, align: node_size, phase: 0, trace: node_size },
        }
    }

    fn capacity_nodes(&self) -> usize {
        (self.slab_size / self.node_size) - self.header_nodes
    }

    fn node_at(&self, slab: &SlabHeadSmall, index: usize) -> NonNull<u8> {
        let offset = (self.header_nodes + index) * self.node_size;
        unsafe { NonNull::new_unchecked((slab.base + offset) as *mut u8) }
    }

    fn slab_of(&self, addr: usize) -> NonNull<SlabHeadSmall> {
        let base = addr & !(self.slab_size - 1);
        unsafe { NonNull::new_unchecked(base as *mut SlabHeadSmall) }
    }

    fn attach_fresh_slab(&self) -> Option<NonNull<SlabHeadSmall>> {
        let raw = self.parent.map()?;
        let base = raw.as_ptr() as usize;
        let header = raw.cast::<SlabHeadSmall>();
        unsafe {
            header.as_ptr().write(SlabHeadSmall {
                bump: AtomicUsize::new(0),
                capacity: self.capacity_nodes(),
                live: AtomicUsize::new(0),
                free_head: AtomicPtr::new(std::ptr::null_mut()),
                state: Mutex::new(SlabState::Attached),
                base,
            });
        }
        self.roster.lock().push(header);
        self.current.store(header.as_ptr(), Ordering::Release);
        Some(header)
    }

    fn try_alloc_from(&self, slab: &SlabHeadSmall) -> Option<NonNull<u8>> {
        // Treiber-stack pop from the free list first: recycled nodes are
        // cache-hotter than bumping into virgin slab territory.
        loop {
            let head = slab.free_head.load(Ordering::Acquire);
            if head.is_null() {
                break;
            }
            let next = unsafe { (head as *const AtomicPtr<u8>).read().load(Ordering::Relaxed) };
            if slab
                .free_head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slab.live.fetch_add(1, Ordering::Relaxed);
                return NonNull::new(head);
            }
        }

        loop {
            let idx = slab.bump.load(Ordering::Relaxed);
            if idx >= slab.capacity {
                return None;
            }
            if slab
                .bump
                .compare_exchange(idx, idx + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slab.live.fetch_add(1, Ordering::Relaxed);
                return Some(self.node_at(slab, idx));
            }
        }
    }
}

impl Pool for NodeSmallPool {
    fn describe(&self) -> PoolDescriptor {
        self.descriptor
    }

    fn map(&self) -> Option<NonNull<u8>> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if let Some(slab) = NonNull::new(current) {
                let slab_ref = unsafe { slab.as_ref() };
                if let Some(node) = self.try_alloc_from(slab_ref) {
                    return Some(node);
                }
                *slab_ref.state.lock() = SlabState::LowFrag;
            }
            // Either no slab yet, or the current one just went LowFrag
            // under us. Either way attach a fresh one and retry; if
            // another thread races us to it that's fine, `current` just
            // gets overwritten again and the loser's slab is still live
            // on the roster.
            self.attach_fresh_slab()?;
        }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        let slab = self.slab_of(ptr.as_ptr() as usize);
        let slab_ref = slab.as_ref();
        loop {
            let head = slab_ref.free_head.load(Ordering::Acquire);
            (ptr.as_ptr() as *mut AtomicPtr<u8>).write(AtomicPtr::new(head));
            if slab_ref
                .free_head
                .compare_exchange(head, ptr.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        let remaining = slab_ref.live.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.current.load(Ordering::Acquire) != slab.as_ptr() {
            let mut state = slab_ref.state.lock();
            if *state != SlabState::Free {
                *state = SlabState::Free;
                drop(state);
                let mut roster = self.roster.lock();
                if let Some(pos) = roster.iter().position(|s| *s == slab) {
                    roster.remove(pos);
                    self.parent.unmap(slab.cast());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{StdVm, VmSource};
    use std::thread;

    struct SlabSource {
        size: usize,
        vm: StdVm,
    }

    impl Pool for SlabSource {
        fn describe(&self) -> PoolDescriptor {
            PoolDescriptor { size: self.size, align: self.size, phase: 0, trace: self.size }
        }
        fn map(&self) -> Option<NonNull<u8>> {
            self.vm.reserve(self.size)
        }
        unsafe fn unmap(&self, ptr: NonNull<u8>) {
            self.vm.release(ptr, self.size)
        }
    }

    fn make_pool() -> Arc<NodeSmallPool> {
        let parent = Arc::new(SlabSource { size: 64 * 1024, vm: StdVm });
        Arc::new(NodeSmallPool::new(parent, 32))
    }

    #[test]
    fn single_thread_alloc_free_recycle() {
        let pool = make_pool();
        let a = pool.map().unwrap();
        unsafe { pool.unmap(a) };
        let b = pool.map().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn concurrent_alloc_yields_distinct_nodes() {
        let pool = make_pool();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..64 {
                        got.push(pool.map().unwrap().as_ptr() as usize);
                    }
                    got
                })
            })
            .collect();
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len(), "no node handed out twice concurrently");
    }
}
