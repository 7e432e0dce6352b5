//! Fixed-size "node" pool: slabs obtained from a parent pool are
//! bump-allocated into fixed-size nodes, with a per-slab free
//! list for reclaimed nodes. `NodePool` is single-threaded; `NodePoolSync`
//! wraps it behind a lock for cross-thread callers.

use crate::pool::{Pool, PoolDescriptor};
use parking_lot::Mutex;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;

/// Slab header, placed at the start of every slab this pool owns. Slabs
/// are requested from the parent pool at a size that is a power of two,
/// so a node's owning slab is recovered by masking the node's address —
/// the same trick `BinaryPoolMaster` uses for its coalescing rendezvous.
#[repr(C)]
struct SuperBlock {
    next_slab: Cell<Option<NonNull<SuperBlock>>>,
    free_head: Cell<Option<NonNull<u8>>>,
    bump: Cell<usize>,
    live: Cell<usize>,
    capacity: usize,
}

pub struct NodePool {
    parent: Arc<dyn Pool>,
    node_size: usize,
    slab_size: usize,
    header_nodes: usize, // number of node-sized slots the header itself occupies
    current: Cell<Option<NonNull<SuperBlock>>>,
    descriptor: PoolDescriptor,
}

impl NodePool {
    pub fn new(parent: Arc<dyn Pool>, node_size: usize) -> Self {
        assert!(node_size >= std::mem::size_of::<usize>());
        let slab_size = parent.describe().size;
        assert!(slab_size.is_power_of_two(), "slab source must hand out power-of-two blocks");
        let header_bytes = std::mem::size_of::<SuperBlock>();
        let header_nodes = (header_bytes + node_size - 1) / node_size;
        NodePool {
            parent,
            node_size,
            slab_size,
            header_nodes,
            current: Cell::new(None),
            descriptor: PoolDescriptor { size: node_size, align: node_size, phase: 0, trace: node_size },
        }
    }

    fn slab_of(&self, addr: usize) -> NonNull<SuperBlock> {
        let base = addr & !(self.slab_size - 1);
        unsafe { NonNull::new_unchecked(base as *mut SuperBlock) }
    }

    fn capacity_nodes(&self) -> usize {
        (self.slab_size / self.node_size) - self.header_nodes
    }

    fn node_at(&self, slab: NonNull<SuperBlock>, index: usize) -> NonNull<u8> {
        let base = slab.as_ptr() as usize;
        let offset = (self.header_nodes + index) * self.node_size;
        unsafe { NonNull::new_unchecked((base + offset) as *mut u8) }
    }

    unsafe fn alloc_fresh_slab(&self) -> Option<NonNull<SuperBlock>> {
        let raw = self.parent.map()?;
        debug_assert_eq!(raw.as_ptr() as usize & (self.slab_size - 1), 0);
        let header = raw.cast::<SuperBlock>();
        header.as_ptr().write(SuperBlock {
            next_slab: Cell::new(self.current.get()),
            free_head: Cell::new(None),
            bump: Cell::new(0),
            live: Cell::new(0),
            capacity: self.capacity_nodes(),
        });
        Some(header)
    }
}

impl Pool for NodePool {
    fn describe(&self) -> PoolDescriptor {
        self.descriptor
    }

    fn map(&self) -> Option<NonNull<u8>> {
        loop {
            if let Some(slab) = self.current.get() {
                let block = unsafe { slab.as_ref() };
                if let Some(free) = block.free_head.get() {
                    let next = unsafe { (free.as_ptr() as *const Option<NonNull<u8>>).read() };
                    block.free_head.set(next);
                    block.live.set(block.live.get() + 1);
                    return Some(free);
                }
                if block.bump.get() < block.capacity {
                    let idx = block.bump.get();
                    block.bump.set(idx + 1);
                    block.live.set(block.live.get() + 1);
                    return Some(self.node_at(slab, idx));
                }
            }
            let fresh = unsafe { self.alloc_fresh_slab() }?;
            self.current.set(Some(fresh));
        }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        let slab = self.slab_of(ptr.as_ptr() as usize);
        let block = slab.as_ref();
        let prior_head = block.free_head.get();
        (ptr.as_ptr() as *mut Option<NonNull<u8>>).write(prior_head);
        block.free_head.set(Some(ptr));
        block.live.set(block.live.get() - 1);

        if block.live.get() == 0 && self.current.get() != Some(slab) {
            // Not the active slab and fully drained: hand it back. The
            // active slab is kept even at zero live nodes so a tight
            // alloc/free cycle on one thread doesn't thrash the parent.
            self.unlink_and_release(slab);
        }
    }
}

impl NodePool {
    unsafe fn unlink_and_release(&self, slab: NonNull<SuperBlock>) {
        let mut cursor = self.current.get();
        let mut prev: Option<NonNull<SuperBlock>> = None;
        while let Some(node) = cursor {
            if node == slab {
                let next = node.as_ref().next_slab.get();
                match prev {
                    Some(p) => p.as_ref().next_slab.set(next),
                    None => self.current.set(next),
                }
                self.parent.unmap(node.cast());
                return;
            }
            prev = Some(node);
            cursor = node.as_ref().next_slab.get();
        }
    }
}

/// Cross-thread wrapper: `NodePool` is not `Sync` on its own (its header
/// bookkeeping uses `Cell`), so this just serializes callers behind a
/// lock rather than reimplementing the bump/free-list logic lock-free.
pub struct NodePoolSync {
    inner: Mutex<NodePool>,
    descriptor: PoolDescriptor,
}

impl NodePoolSync {
    pub fn new(parent: Arc<dyn Pool>, node_size: usize) -> Self {
        let inner = NodePool::new(parent, node_size);
        let descriptor = inner.describe();
        NodePoolSync { inner: Mutex::new(inner), descriptor }
    }
}

impl Pool for NodePoolSync {
    fn describe(&self) -> PoolDescriptor {
        self.descriptor
    }

    fn map(&self) -> Option<NonNull<u8>> {
        self.inner.lock().map()
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        self.inner.lock().unmap(ptr)
    }
}

// SAFETY: all access to the inner `NodePool` (and the `Cell`s inside its
// slab headers) goes through `inner`'s mutex.
unsafe impl Send for NodePoolSync {}
unsafe impl Sync for NodePoolSync {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{StdVm, VmSource};

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

    fn make_pool(node_size: usize) -> NodePool {
        let parent = Arc::new(SlabSource { size: 64 * 1024, vm: StdVm });
        NodePool::new(parent, node_size)
    }

    #[test]
    fn bump_then_free_list_reuse() {
        let pool = make_pool(64);
        let a = pool.map().unwrap();
        let b = pool.map().unwrap();
        assert_ne!(a, b);
        unsafe { pool.unmap(a) };
        let c = pool.map().unwrap();
        assert_eq!(a, c, "freed node should be recycled before bumping further");
    }

    #[test]
    fn drained_non_active_slab_is_released() {
        let pool = make_pool(4096);
        let mut handed_out = Vec::new();
        for _ in 0..20 {
            handed_out.push(pool.map().unwrap());
        }
        for ptr in handed_out {
            unsafe { pool.unmap(ptr) };
        }
        // No assertion beyond "doesn't panic/leak the address space" —
        // the pool keeps only its active slab once all others drain.
    }

    #[test]
    fn sync_wrapper_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NodePoolSync>();
    }
}
