//! Temporal (bump/arena) allocator: hands out variable-sized,
//! variably-aligned allocations from slabs that are
//! normally all released together when the arena retires. The
//! "inner-refs" trick lets a handful of allocations outlive that
//! retirement without forcing the whole arena to track individual frees:
//! each slab keeps a synthetic refcount seeded at 1 (the arena's own
//! "still open" reference); `alloc` adds a ref per allocation and
//! `release` removes one; the slab only actually goes back to the parent
//! pool once `retire()` has dropped the arena's own ref *and* every
//! allocation taken from it has been individually released.

use crate::align::{align_place, align_spec_of};
use crate::pool::{Pool, PoolDescriptor};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LIFETIME_SKEW_WARN: Duration = Duration::from_secs(5);
const SAMPLE_EVERY: usize = 64;

struct TemporalSlab {
    base: usize,
    end: usize,
    bump: usize,
    outstanding: AtomicUsize,
    retired: AtomicBool,
    retired_at: Mutex<Option<Instant>>,
}

pub struct TemporalBase {
    parent: Arc<dyn Pool>,
    slab_size: usize,
    current: Mutex<Option<NonNull<TemporalSlab>>>,
    roster: Mutex<Vec<NonNull<TemporalSlab>>>,
    sample_counter: AtomicUsize,
    descriptor: PoolDescriptor,
}

unsafe impl Send for TemporalBase {}
unsafe impl Sync for TemporalBase {}

impl TemporalBase {
    pub fn new(parent: Arc<dyn Pool>) -> Self {
        let slab_size = parent.describe().size;
        assert!(slab_size.is_power_of_two());
        TemporalBase {
            parent,
            slab_size,
            current: Mutex::new(None),
            roster: Mutex::new(Vec::new()),
            sample_counter: AtomicUsize::new(0),
            descriptor: PoolDescriptor { size: 0, align: 0, phase: 0, trace: 0 },
        }
    }

    fn header_bytes() -> usize {
        std::mem::size_of::<TemporalSlab>()
    }

    fn fresh_slab(&self) -> Option<NonNull<TemporalSlab>> {
        let raw = self.parent.map()?;
        let base = raw.as_ptr() as usize;
        let header = raw.cast::<TemporalSlab>();
        unsafe {
            header.as_ptr().write(TemporalSlab {
                base,
                end: base + self.slab_size,
                bump: base + Self::header_bytes(),
                outstanding: AtomicUsize::new(1),
                retired: AtomicBool::new(false),
                retired_at: Mutex::new(None),
            });
        }
        self.roster.lock().push(header);
        Some(header)
    }

    fn slab_of(&self, addr: usize) -> NonNull<TemporalSlab> {
        let base = addr & !(self.slab_size - 1);
        unsafe { NonNull::new_unchecked(base as *mut TemporalSlab) }
    }

    /// Bump-allocates `size` bytes placed so that `(addr + phase) % align
    /// == 0` for the alignment class `align_spec_of` derives.
    pub fn alloc(&self, size: usize, phase: usize) -> Option<NonNull<u8>> {
        let spec = align_spec_of(size, phase);
        let mut current = self.current.lock();
        loop {
            if let Some(slab_ptr) = *current {
                let slab = unsafe { &mut *slab_ptr.as_ptr() };
                if let Some(user) = align_place(&spec, slab.bump, slab.end) {
                    slab.bump = user + spec.place_bytes;
                    slab.outstanding.fetch_add(1, Ordering::Relaxed);
                    return NonNull::new(user as *mut u8);
                }
                // Doesn't fit: retire this slab (drop the arena's own
                // ref) and move on to a fresh one.
                self.retire_slab(slab_ptr);
            }
            *current = self.fresh_slab();
            if current.is_none() {
                return None;
            }
        }
    }

    fn retire_slab(&self, slab_ptr: NonNull<TemporalSlab>) {
        let slab = unsafe { slab_ptr.as_ref() };
        if slab.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        *slab.retired_at.lock() = Some(Instant::now());
        if slab.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.release_slab(slab_ptr);
        }
    }

    fn release_slab(&self, slab_ptr: NonNull<TemporalSlab>) {
        let mut roster = self.roster.lock();
        if let Some(pos) = roster.iter().position(|s| *s == slab_ptr) {
            roster.remove(pos);
            unsafe { self.parent.unmap(slab_ptr.cast()) };
        }
    }

    /// Drops an individual allocation's share of its slab's synthetic
    /// refcount. Once both the arena (via `retire`) and every allocation
    /// have released their share, the slab goes back to the parent pool.
    pub fn release(&self, ptr: NonNull<u8>) {
        let slab_ptr = self.slab_of(ptr.as_ptr() as usize);
        let slab = unsafe { slab_ptr.as_ref() };

        if slab.retired.load(Ordering::Acquire) {
            let sampled = self.sample_counter.fetch_add(1, Ordering::Relaxed) % SAMPLE_EVERY == 0;
            if sampled {
                if let Some(retired_at) = *slab.retired_at.lock() {
                    if retired_at.elapsed() > LIFETIME_SKEW_WARN {
                        tracing::warn!(
                            skew_secs = retired_at.elapsed().as_secs(),
                            "temporal allocation released long after its arena retired"
                        );
                    }
                }
            }
        }

        if slab.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.release_slab(slab_ptr);
        }
    }

    /// Retires the active slab, signalling that no further `alloc` calls
    /// will land on it. Outstanding `release`s still settle normally.
    pub fn retire(&self) {
        if let Some(slab_ptr) = self.current.lock().take() {
            self.retire_slab(slab_ptr);
        }
    }
}

impl Drop for TemporalBase {
    fn drop(&mut self) {
        self.retire();
        let leftover: Vec<_> = self.roster.lock().drain(..).collect();
        for slab in leftover {
            // Anything still here at drop time has permanently-leaked
            // inner refs (a caller never released an allocation); give
            // the backing memory back anyway rather than hold it forever.
            unsafe { self.parent.unmap(slab.cast()) };
        }
    }
}

/// Per-thread/scheduler binding over a shared [`TemporalBase`] (the
/// affinity graph's `Temporal` variant). Distinct instances share no
/// state beyond the base pool; this exists so `crate::affinity` can hand
/// each binding its own arena lifecycle without threads racing on
/// `retire()`.
pub struct TemporalAffinity {
    base: TemporalBase,
}

impl TemporalAffinity {
    pub fn new(parent: Arc<dyn Pool>) -> Self {
        TemporalAffinity { base: TemporalBase::new(parent) }
    }

    pub fn alloc(&self, size: usize, phase: usize) -> Option<NonNull<u8>> {
        self.base.alloc(size, phase)
    }

    pub fn release(&self, ptr: NonNull<u8>) {
        self.base.release(ptr)
    }

    pub fn retire(&self) {
        self.base.retire()
    }
}

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

    fn make_base() -> TemporalBase {
        let parent = Arc::new(SlabSource { size: 64 * 1024, vm: StdVm });
        TemporalBase::new(parent)
    }

    #[test]
    fn sequential_allocs_bump_forward() {
        let base = make_base();
        let a = base.alloc(64, 0).unwrap();
        let b = base.alloc(64, 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn retire_then_release_frees_slab() {
        let base = make_base();
        let a = base.alloc(64, 0).unwrap();
        base.retire();
        // Arena retired but allocation not yet released: slab still
        // owned, no panic or premature release.
        base.release(a);
    }

    #[test]
    fn release_before_retire_keeps_slab_alive_for_more_allocs() {
        let base = make_base();
        let a = base.alloc(64, 0).unwrap();
        base.release(a);
        let b = base.alloc(64, 0).unwrap();
        assert_ne!(a, b, "bump cursor doesn't rewind on an early release");
    }
}
