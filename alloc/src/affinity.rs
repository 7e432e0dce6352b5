//! Affinity graph: chooses which backing pool a request routes to based
//! on *why* the memory is needed, not just its size.
//! `Inherent` is the default, process-wide graph (a chain of binary-pool
//! masters feeding line/page node pools, sharded by alignment class);
//! `Temporal` binds an arena to a single task/scope's lifetime; `Platform`
//! skips the tiers entirely for allocations large enough that tiering
//! would only add overhead.

use crate::align::{align_alloc, align_place, align_spec_of, unalign_alloc, AlignSpec, Scale};
use crate::binary_pool::BinaryPoolMaster;
use crate::node_pool::NodePoolSync;
use crate::pool::{Pool, PoolDescriptor};
use crate::small_pool::NodeSmallPool;
use crate::temporal::TemporalAffinity;
use crate::vm::{StdVm, VmSource, HUGE_PAGE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// Below this, line-scale requests go to the lock-free `NodeSmallPool`;
/// at or above it they go to a `NodePoolSync` parented on a binary-master
/// tier ("threaded node pools for size < 128; others use sync node pools
/// parented by a power-of-two ancestor pool").
const THREADED_SMALL_CUTOFF: usize = 128;

/// `BinaryMasterSize` tiers, smallest to largest. The root master's
/// parent is a platform-backed 2 MiB block (`TopVmPool`); each
/// successively smaller tier is parented on the next one up.
const BINARY_MASTER_SIZES: [usize; 6] = [32 * 1024, 64 * 1024, 128 * 1024, 256 * 1024, 512 * 1024, 1024 * 1024];

/// A placed allocation plus enough to find its way back to `free`: the
/// exact pool instance `ptr` came from, so `free` never has to infer the
/// backing source from size (which can misroute a pointer whose size
/// happens to coincide with an unrelated pool's block size).
#[derive(Clone)]
pub struct Placement {
    pub ptr: NonNull<u8>,
    pub backing: Arc<dyn Pool>,
}

pub trait Affinity: Send + Sync {
    fn alloc(&self, size: usize, phase: usize) -> Option<Placement>;
    fn free(&self, placement: Placement);
    /// Produces a new binding that shares this affinity's backing pools
    /// but tracks its own scope (the allocation-side analogue of a
    /// scheduler's `fork()`: a forked scheduler gets its own affinity
    /// binding without re-creating the pool hierarchy underneath it).
    fn fork(&self) -> Arc<dyn Affinity>;
}

/// The root 2 MiB block every binary-master chain is rooted on, backed
/// directly by the platform's huge-page path.
struct TopVmPool {
    vm: Arc<dyn VmSource>,
}

impl Pool for TopVmPool {
    fn describe(&self) -> PoolDescriptor {
        PoolDescriptor { size: HUGE_PAGE, align: HUGE_PAGE, phase: 0, trace: HUGE_PAGE }
    }
    fn map(&self) -> Option<NonNull<u8>> {
        self.vm.huge_page_alloc()
    }
    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        self.vm.huge_page_free(ptr)
    }
}

/// Single-use block taken directly from the virtual-memory source, no
/// slab/pool recycling involved: the `Unique` alignment scale's backing.
struct VmBlockPool {
    vm: Arc<dyn VmSource>,
    bytes: usize,
}

impl Pool for VmBlockPool {
    fn describe(&self) -> PoolDescriptor {
        PoolDescriptor { size: self.bytes, align: self.bytes, phase: 0, trace: self.bytes }
    }
    fn map(&self) -> Option<NonNull<u8>> {
        if self.bytes >= HUGE_PAGE {
            self.vm.huge_page_alloc()
        } else {
            self.vm.reserve(self.bytes)
        }
    }
    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        if self.bytes >= HUGE_PAGE {
            self.vm.huge_page_free(ptr)
        } else {
            self.vm.release(ptr, self.bytes)
        }
    }
}

/// Chain of `BinaryPoolMaster` instances keyed by `{32k,64k,...,1M}`,
/// each parented on the next larger tier (the 2 MiB top is
/// platform-backed). `pool_for_at_least` is how the line/page node pools
/// above find a power-of-two ancestor big enough to slab from.
pub struct BinaryMasterChain {
    tiers: Vec<Arc<BinaryPoolMaster>>, // ascending: tiers[0] == 32k, tiers.last() == 1M
}

impl BinaryMasterChain {
    pub fn new(vm: Arc<dyn VmSource>) -> Self {
        let mut parent: Arc<dyn Pool> = Arc::new(TopVmPool { vm });
        let mut tiers = Vec::with_capacity(BINARY_MASTER_SIZES.len());
        for &half in BINARY_MASTER_SIZES.iter().rev() {
            let master = Arc::new(BinaryPoolMaster::new(Arc::clone(&parent), half));
            parent = Arc::clone(&master) as Arc<dyn Pool>;
            tiers.push(master);
        }
        tiers.reverse();
        BinaryMasterChain { tiers }
    }

    /// Smallest tier whose block size is `>= bytes`, or the largest tier
    /// if `bytes` exceeds every tier (the caller is expected to keep
    /// `bytes` under 1 MiB; page-scale requests never reach that high).
    pub fn pool_for_at_least(&self, bytes: usize) -> Arc<dyn Pool> {
        self.tiers
            .iter()
            .find(|m| m.describe().size >= bytes)
            .or_else(|| self.tiers.last())
            .map(|m| Arc::clone(m) as Arc<dyn Pool>)
            .expect("binary master chain is never empty")
    }
}

/// Wraps a zero-phase, fixed-size inner pool so its blocks can satisfy an
/// arbitrary `(size, phase)` request: slides the user pointer within the
/// raw block per `align_place`, and stashes the raw pointer via
/// `align_alloc` so `unmap` can recover and release it. Generalizes the
/// "non-zero-phase page pools proxied via `ProxyPool`" idea to every
/// alignment scale, not just page-scale ones.
pub struct ProxyPool {
    inner: Arc<dyn Pool>,
    spec: AlignSpec,
}

impl ProxyPool {
    pub fn new(inner: Arc<dyn Pool>, spec: AlignSpec) -> Self {
        ProxyPool { inner, spec }
    }
}

impl Pool for ProxyPool {
    fn describe(&self) -> PoolDescriptor {
        PoolDescriptor { size: self.spec.place_bytes, align: self.spec.align_bytes, phase: self.spec.phase, trace: self.spec.size }
    }

    fn map(&self) -> Option<NonNull<u8>> {
        let raw = self.inner.map()?;
        let raw_addr = raw.as_ptr() as usize;
        let raw_end = raw_addr + self.inner.describe().size;
        let user_addr = match align_place(&self.spec, raw_addr, raw_end) {
            Some(addr) => addr,
            // Slack is sized so this should never happen for a correctly
            // configured inner pool; give the block back rather than
            // leak it if it somehow does.
            None => {
                unsafe { self.inner.unmap(raw) };
                return None;
            }
        };
        let user = NonNull::new(user_addr as *mut u8)?;
        unsafe { align_alloc(user, raw) };
        Some(user)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        let raw = unalign_alloc(ptr);
        self.inner.unmap(raw);
    }
}

/// Shared pool caches behind an `InherentAffinity` and its forks: keyed
/// by exact node size, one `NodeSmallPool`/`NodePoolSync` per size seen
/// so far (the literal spec calls for fixed-size thread-local/bucketed
/// tables; a shared locked map is the simplification documented in
/// `DESIGN.md`, matching `AffinityRegistry`'s own tradeoff below).
struct InherentPools {
    chain: BinaryMasterChain,
    vm: Arc<dyn VmSource>,
    small_cache: Mutex<HashMap<usize, Arc<dyn Pool>>>,
    node_cache: Mutex<HashMap<usize, Arc<dyn Pool>>>,
}

impl InherentPools {
    fn new() -> Self {
        let vm: Arc<dyn VmSource> = Arc::new(StdVm);
        InherentPools {
            chain: BinaryMasterChain::new(Arc::clone(&vm)),
            vm,
            small_cache: Mutex::new(HashMap::new()),
            node_cache: Mutex::new(HashMap::new()),
        }
    }

    fn small_pool_for(&self, node_size: usize) -> Arc<dyn Pool> {
        let mut cache = self.small_cache.lock();
        if let Some(pool) = cache.get(&node_size) {
            return Arc::clone(pool);
        }
        let parent = self.chain.pool_for_at_least(node_size.saturating_mul(64));
        let pool: Arc<dyn Pool> = Arc::new(NodeSmallPool::new(parent, node_size));
        cache.insert(node_size, Arc::clone(&pool));
        pool
    }

    fn node_pool_for(&self, node_size: usize) -> Arc<dyn Pool> {
        let mut cache = self.node_cache.lock();
        if let Some(pool) = cache.get(&node_size) {
            return Arc::clone(pool);
        }
        let parent = self.chain.pool_for_at_least(node_size);
        let pool: Arc<dyn Pool> = Arc::new(NodePoolSync::new(parent, node_size));
        cache.insert(node_size, Arc::clone(&pool));
        pool
    }

    /// Picks the zero-phase backing pool for `spec.alloc_bytes`, per
    /// alignment scale.
    fn backing_for(&self, spec: &AlignSpec) -> Arc<dyn Pool> {
        match spec.scale {
            Scale::Unique => Arc::new(VmBlockPool { vm: Arc::clone(&self.vm), bytes: spec.alloc_bytes }),
            Scale::Line if spec.alloc_bytes < THREADED_SMALL_CUTOFF => self.small_pool_for(spec.alloc_bytes),
            Scale::Line | Scale::Page => self.node_pool_for(spec.alloc_bytes),
        }
    }
}

/// Default graph: a chain of binary-pool masters feeding line/page node
/// pools, sharded by alignment scale, with a direct virtual-memory path
/// for `Unique`-scale requests.
pub struct InherentAffinity {
    pools: Arc<InherentPools>,
}

impl InherentAffinity {
    pub fn new() -> Self {
        InherentAffinity { pools: Arc::new(InherentPools::new()) }
    }
}

impl Default for InherentAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl Affinity for InherentAffinity {
    fn alloc(&self, size: usize, phase: usize) -> Option<Placement> {
        let spec = align_spec_of(size, phase);
        let backing = self.pools.backing_for(&spec);
        let proxy: Arc<dyn Pool> = Arc::new(ProxyPool::new(backing, spec));
        let ptr = proxy.map()?;
        Some(Placement { ptr, backing: proxy })
    }

    fn free(&self, placement: Placement) {
        unsafe { placement.backing.unmap(placement.ptr) };
    }

    fn fork(&self) -> Arc<dyn Affinity> {
        Arc::new(InherentAffinity { pools: Arc::clone(&self.pools) })
    }
}

/// Adapts a `TemporalAffinity`'s `release` into the uniform `Pool`
/// interface `Placement::backing` expects; `map` is never called through
/// this path (the arena itself does the bump-allocating).
struct TemporalReleaseAdapter {
    arena: Arc<TemporalAffinity>,
}

impl Pool for TemporalReleaseAdapter {
    fn describe(&self) -> PoolDescriptor {
        PoolDescriptor { size: 0, align: 1, phase: 0, trace: 0 }
    }
    fn map(&self) -> Option<NonNull<u8>> {
        None
    }
    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        self.arena.release(ptr)
    }
}

/// A single task/scope's arena binding. `free` here is really
/// `TemporalBase::release` (the inner-refs trick); the arena as a whole
/// is torn down by dropping the binding or calling `retire`.
pub struct TemporalBinding {
    arena: Arc<TemporalAffinity>,
}

impl TemporalBinding {
    pub fn new(parent: Arc<dyn Pool>) -> Self {
        TemporalBinding { arena: Arc::new(TemporalAffinity::new(parent)) }
    }

    pub fn retire(&self) {
        self.arena.retire();
    }
}

impl Affinity for TemporalBinding {
    fn alloc(&self, size: usize, phase: usize) -> Option<Placement> {
        let ptr = self.arena.alloc(size, phase)?;
        let backing: Arc<dyn Pool> = Arc::new(TemporalReleaseAdapter { arena: Arc::clone(&self.arena) });
        Some(Placement { ptr, backing })
    }

    fn free(&self, placement: Placement) {
        unsafe { placement.backing.unmap(placement.ptr) };
    }

    fn fork(&self) -> Arc<dyn Affinity> {
        Arc::new(TemporalBinding { arena: Arc::clone(&self.arena) })
    }
}

/// Bypasses tiering entirely: every request goes straight to the
/// platform's virtual-memory source. Used for allocations the affinity
/// graph's caller already knows are huge-page-class, and as the landing
/// pad once `InherentAffinity` falls through its cyclic tiers.
pub struct PlatformAffinity {
    vm: Arc<dyn VmSource>,
}

impl PlatformAffinity {
    pub fn new(vm: Arc<dyn VmSource>) -> Self {
        PlatformAffinity { vm }
    }
}

impl Affinity for PlatformAffinity {
    fn alloc(&self, size: usize, phase: usize) -> Option<Placement> {
        let spec = align_spec_of(size, phase);
        let backing: Arc<dyn Pool> = Arc::new(VmBlockPool { vm: Arc::clone(&self.vm), bytes: spec.alloc_bytes });
        let proxy: Arc<dyn Pool> = Arc::new(ProxyPool::new(backing, spec));
        let ptr = proxy.map()?;
        Some(Placement { ptr, backing: proxy })
    }

    fn free(&self, placement: Placement) {
        unsafe { placement.backing.unmap(placement.ptr) };
    }

    fn fork(&self) -> Arc<dyn Affinity> {
        Arc::new(PlatformAffinity { vm: Arc::clone(&self.vm) })
    }
}

/// Binds affinity handles to scheduler/thread owners, mirroring
/// `sync::pooled`'s hashed table of monitors bound to owners — except
/// here the registry is small enough (one entry per live scheduler) that
/// a plain locked map is the right tool rather than a fixed hash table.
pub struct AffinityRegistry {
    bindings: Mutex<HashMap<usize, Arc<dyn Affinity>>>,
    root: Arc<dyn Affinity>,
}

impl AffinityRegistry {
    pub fn new() -> Self {
        AffinityRegistry { bindings: Mutex::new(HashMap::new()), root: Arc::new(InherentAffinity::new()) }
    }

    /// Binds `owner` (typically a scheduler id) to its own forked
    /// affinity handle, creating one from the root graph if needed.
    pub fn bind(&self, owner: usize) -> Arc<dyn Affinity> {
        let mut bindings = self.bindings.lock();
        bindings.entry(owner).or_insert_with(|| self.root.fork()).clone()
    }

    pub fn unbind(&self, owner: usize) {
        self.bindings.lock().remove(&owner);
    }
}

impl Default for AffinityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherent_round_trips_small_and_huge() {
        let affinity = InherentAffinity::new();
        let small = affinity.alloc(64, 0).unwrap();
        affinity.free(small);
        let huge = affinity.alloc(HUGE_PAGE, 0).unwrap();
        affinity.free(huge);
    }

    #[test]
    fn inherent_honors_nonzero_phase() {
        let affinity = InherentAffinity::new();
        let spec = align_spec_of(96, 24);
        let placement = affinity.alloc(96, 24).unwrap();
        assert_eq!((placement.ptr.as_ptr() as usize + 24) % spec.align_bytes, 0);
        affinity.free(placement);
    }

    #[test]
    fn inherent_routes_small_and_large_line_scale_through_distinct_pools() {
        let affinity = InherentAffinity::new();
        let tiny = affinity.alloc(32, 0).unwrap();
        let bigger = affinity.alloc(512, 0).unwrap();
        affinity.free(tiny);
        affinity.free(bigger);
    }

    #[test]
    fn free_uses_the_placements_own_backing_not_a_size_guess() {
        // Two placements whose raw sizes could plausibly collide under a
        // size-based dispatch must each free through their own pool
        // without the caller ever comparing sizes.
        let affinity = InherentAffinity::new();
        let a = affinity.alloc(64, 0).unwrap();
        let b = affinity.alloc(4096 + 8, 0).unwrap();
        affinity.free(a);
        affinity.free(b);
    }

    #[test]
    fn registry_binds_distinct_owners_to_distinct_handles() {
        let registry = AffinityRegistry::new();
        let a = registry.bind(1);
        let b = registry.bind(2);
        assert!(!Arc::ptr_eq(&a, &b));
        let a_again = registry.bind(1);
        assert!(Arc::ptr_eq(&a, &a_again));
    }

    #[test]
    fn temporal_binding_frees_through_its_arena() {
        let parent: Arc<dyn Pool> = {
            struct SlabSource;
            impl Pool for SlabSource {
                fn describe(&self) -> crate::pool::PoolDescriptor {
                    crate::pool::PoolDescriptor { size: 64 * 1024, align: 64 * 1024, phase: 0, trace: 64 * 1024 }
                }
                fn map(&self) -> Option<NonNull<u8>> {
                    StdVm.reserve(64 * 1024)
                }
                unsafe fn unmap(&self, ptr: NonNull<u8>) {
                    StdVm.release(ptr, 64 * 1024)
                }
            }
            Arc::new(SlabSource)
        };
        let binding = TemporalBinding::new(parent);
        let placement = binding.alloc(128, 0).unwrap();
        binding.free(placement);
        binding.retire();
    }

    #[test]
    fn platform_affinity_honors_phase_too() {
        let platform = PlatformAffinity::new(Arc::new(StdVm));
        let spec = align_spec_of(256, 40);
        let placement = platform.alloc(256, 40).unwrap();
        assert_eq!((placement.ptr.as_ptr() as usize + 40) % spec.align_bytes, 0);
        platform.free(placement);
    }

    #[test]
    fn binary_master_chain_hands_out_every_tier() {
        let chain = BinaryMasterChain::new(Arc::new(StdVm));
        let small = chain.pool_for_at_least(1);
        assert_eq!(small.describe().size, 32 * 1024);
        let big = chain.pool_for_at_least(600 * 1024);
        assert_eq!(big.describe().size, 1024 * 1024);
    }
}
