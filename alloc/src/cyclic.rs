//! Size-tiered recycling pool ("CyclicPool"): one instance is bound to a
//! single fixed `element_bytes`, not a dispatcher across sizes. Per
//! thread, it keeps a root slab plus a chain of retired-but-reusable
//! slabs, and grows the root into the next of five unit levels when the
//! current one saturates.
//!
//! Unit levels are keyed by two distinct tables: `ELEMENT_CAPS` bounds how
//! many `element_bytes`-sized objects a level can address (the thing
//! `element_bytes` is compared against to pick a starting level),
//! `SLAB_SIZES` is how many bytes of virtual memory that level's slab
//! actually reserves. The two are not the same number — conflating them
//! would pick a slab far too small or a cap far too big for its tier.

use crate::vm::{StdVm, VmSource};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

/// Per-level element-count ceiling: the level an `element_bytes` request
/// starts at is the smallest level whose cap it fits under.
pub const ELEMENT_CAPS: [usize; 5] = [32, 160, 896, 3840, 16384];
/// Per-level slab byte size (the virtual memory a level's slab reserves).
pub const SLAB_SIZES: [usize; 5] = [208, 1088, 5376, 22912, 98304];

const LEVELS: usize = ELEMENT_CAPS.len();

struct CyclicSlab {
    level: usize,
    raw: NonNull<u8>,
    elem_size: usize,
    cap: usize,
    bump: usize,
    free_head: Option<NonNull<u8>>,
    live: usize,
}

impl CyclicSlab {
    fn contains(&self, addr: usize) -> bool {
        let base = self.raw.as_ptr() as usize;
        addr >= base && addr < base + self.cap * self.elem_size
    }

    fn has_capacity(&self) -> bool {
        self.free_head.is_some() || self.bump < self.cap
    }

    fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn try_alloc(&mut self) -> Option<NonNull<u8>> {
        if let Some(head) = self.free_head {
            let next = unsafe { (head.as_ptr() as *const Option<NonNull<u8>>).read() };
            self.free_head = next;
            self.live += 1;
            return Some(head);
        }
        if self.bump < self.cap {
            let idx = self.bump;
            self.bump += 1;
            self.live += 1;
            let base = self.raw.as_ptr() as usize;
            return NonNull::new((base + idx * self.elem_size) as *mut u8);
        }
        None
    }

    fn push_free(&mut self, ptr: NonNull<u8>) {
        unsafe { (ptr.as_ptr() as *mut Option<NonNull<u8>>).write(self.free_head) };
        self.free_head = Some(ptr);
        self.live -= 1;
    }
}

/// Per-thread growth state for one `CyclicPool`. Its `Drop` impl is what
/// returns every slab to the virtual-memory source on thread exit ("on
/// finalize all slabs and the root are returned to their tier pools").
struct RootState {
    vm: Arc<dyn VmSource>,
    element_bytes: usize,
    root: Option<CyclicSlab>,
    chain: Vec<CyclicSlab>,
}

fn min_level_for(element_bytes: usize) -> Option<usize> {
    ELEMENT_CAPS.iter().position(|&cap| element_bytes <= cap)
}

impl RootState {
    fn alloc_slab(&self, level: usize) -> Option<CyclicSlab> {
        let bytes = SLAB_SIZES[level];
        let raw = self.vm.reserve(bytes)?;
        let cap = bytes / self.element_bytes;
        Some(CyclicSlab { level, raw, elem_size: self.element_bytes, cap, bump: 0, free_head: None, live: 0 })
    }

    /// Keeps at most one fully-empty slab in the chain, releasing the
    /// rest back to the virtual-memory source.
    fn release_excess_empty(&mut self) {
        let vm = Arc::clone(&self.vm);
        let mut kept_one = false;
        let mut i = 0;
        while i < self.chain.len() {
            if self.chain[i].is_empty() {
                if kept_one {
                    let slab = self.chain.remove(i);
                    vm.release(slab.raw, SLAB_SIZES[slab.level]);
                    continue;
                }
                kept_one = true;
            }
            i += 1;
        }
    }

    fn promote_root(&mut self, fresh: CyclicSlab) {
        if let Some(old) = self.root.take() {
            self.chain.push(old);
        }
        self.root = Some(fresh);
    }

    fn alloc(&mut self) -> Option<NonNull<u8>> {
        if let Some(root) = self.root.as_mut() {
            if let Some(ptr) = root.try_alloc() {
                return Some(ptr);
            }
        }

        // Root's tier is saturated. Reuse the emptiest reusable slab from
        // the chain if one has room, otherwise grow.
        self.chain.sort_by_key(|s| s.live);
        if let Some(pos) = self.chain.iter().position(|s| s.has_capacity()) {
            let mut reused = self.chain.remove(pos);
            let ptr = reused.try_alloc()?;
            self.promote_root(reused);
            self.release_excess_empty();
            return Some(ptr);
        }

        let next_level = match &self.root {
            Some(r) if r.level + 1 < LEVELS => r.level + 1,
            Some(r) => r.level, // already at the saturated top tier: add another slab at the same level
            None => min_level_for(self.element_bytes)?,
        };
        let fresh = self.alloc_slab(next_level)?;
        self.promote_root(fresh);
        let ptr = self.root.as_mut().unwrap().try_alloc();
        self.release_excess_empty();
        ptr
    }

    fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if let Some(root) = self.root.as_mut() {
            if root.contains(addr) {
                root.push_free(ptr);
                return;
            }
        }
        if let Some(slab) = self.chain.iter_mut().find(|s| s.contains(addr)) {
            slab.push_free(ptr);
        }
    }
}

impl Drop for RootState {
    fn drop(&mut self) {
        if let Some(slab) = self.root.take() {
            self.vm.release(slab.raw, SLAB_SIZES[slab.level]);
        }
        for slab in self.chain.drain(..) {
            self.vm.release(slab.raw, SLAB_SIZES[slab.level]);
        }
    }
}

thread_local! {
    static ROOTS: RefCell<Vec<(usize, RootState)>> = RefCell::new(Vec::new());
}

/// A pool of fixed-size `element_bytes` objects, growing per-thread
/// through the five unit levels above. Construct one per named
/// allocation site, not once per request size.
pub struct CyclicPool {
    element_bytes: usize,
    vm: Arc<dyn VmSource>,
}

impl CyclicPool {
    /// `None` if `element_bytes` exceeds the largest unit level's cap.
    pub fn new(element_bytes: usize) -> Option<Self> {
        if element_bytes == 0 {
            return None;
        }
        min_level_for(element_bytes)?;
        Some(CyclicPool { element_bytes, vm: Arc::new(StdVm) })
    }

    fn self_key(&self) -> usize {
        self as *const CyclicPool as usize
    }

    fn with_root<R>(&self, f: impl FnOnce(&mut RootState) -> R) -> R {
        let key = self.self_key();
        ROOTS.with(|roots| {
            let mut roots = roots.borrow_mut();
            if let Some(entry) = roots.iter_mut().find(|(k, _)| *k == key) {
                f(&mut entry.1)
            } else {
                roots.push((
                    key,
                    RootState { vm: Arc::clone(&self.vm), element_bytes: self.element_bytes, root: None, chain: Vec::new() },
                ));
                f(&mut roots.last_mut().unwrap().1)
            }
        })
    }

    pub fn element_bytes(&self) -> usize {
        self.element_bytes
    }

    pub fn alloc(&self) -> Option<NonNull<u8>> {
        self.with_root(|state| state.alloc())
    }

    /// # Safety
    /// `ptr` must have come from `alloc` on this same pool and not
    /// already have been freed.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.with_root(|state| state.free(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_caps_and_slab_sizes_are_distinct_tables() {
        // These must never be accidentally swapped or unified: a tier's
        // element cap is roughly 6-7x smaller than its slab size.
        for level in 0..LEVELS {
            assert!(ELEMENT_CAPS[level] < SLAB_SIZES[level]);
        }
    }

    #[test]
    fn starting_level_matches_element_cap_not_slab_size() {
        // 100 bytes fits the level-0 element cap (32 is too small, so it
        // starts at level 1 whose cap is 160); it must not be confused
        // with the level-0 *slab* size (208), which 100 also fits under.
        assert_eq!(min_level_for(100), Some(1));
        assert_eq!(min_level_for(32), Some(0));
        assert_eq!(min_level_for(160), Some(1));
        assert_eq!(min_level_for(16384), Some(4));
        assert_eq!(min_level_for(16385), None);
    }

    #[test]
    fn alloc_free_recycles_same_slot() {
        let pool = CyclicPool::new(64).unwrap();
        let a = pool.alloc().unwrap();
        unsafe { pool.free(a) };
        let b = pool.alloc().unwrap();
        assert_eq!(a, b, "freed element should come back before bumping further");
    }

    #[test]
    fn saturating_root_promotes_to_next_level() {
        let pool = CyclicPool::new(32).unwrap();
        // Level 0's slab holds 208/32 = 6 elements. Exhaust it and the
        // next allocation must promote rather than fail.
        let mut handed_out = Vec::new();
        for _ in 0..6 {
            handed_out.push(pool.alloc().unwrap());
        }
        let promoted = pool.alloc();
        assert!(promoted.is_some(), "root should promote to a larger level instead of failing");
    }

    #[test]
    fn oversized_element_is_rejected_at_construction() {
        assert!(CyclicPool::new(20_000).is_none());
    }

    #[test]
    fn freeing_through_chain_after_promotion_still_finds_its_slab() {
        let pool = CyclicPool::new(32).unwrap();
        let first_batch: Vec<_> = (0..6).map(|_| pool.alloc().unwrap()).collect();
        // Promotes root to level 1; first_batch now lives in the chain.
        let _second = pool.alloc().unwrap();
        for ptr in first_batch {
            unsafe { pool.free(ptr) };
        }
    }
}
