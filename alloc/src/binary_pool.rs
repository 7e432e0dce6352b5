//! Binary (buddy) pool: recursively splits a parent block of size `2N`
//! into two `N`-sized "moieties", reunifying them back into a single
//! parent-sized block once both halves are unmapped.
//!
//! Coalescing rendezvous uses the same masking trick used elsewhere for
//! slab headers: model the allocation prefix as an offset so masking
//! recovers the head. Every parent block this pool ever hands a half
//! from is aligned to `2N`, so a half's parent base is just
//! `addr & !(2N - 1)` — no side table mapping half-pointer to base is
//! needed. A fixed 4096-slot table is keyed by that base's hash and
//! serves double duty as both "spare half available for reuse" and
//! "coalescing rendezvous point".

use crate::pool::{Pool, PoolDescriptor};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BUCKETS: usize = 4096;
const THREAD_BUFFER_CAP: usize = 16;

fn hash_base(base: usize) -> usize {
    let mut h = base as u64;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h as usize
}

struct Bucket {
    spares: Mutex<Vec<usize>>, // base addresses of parent blocks with exactly one outstanding half
}

pub struct BinaryPoolMaster {
    parent: Arc<dyn Pool>,
    half_size: usize,
    table: Vec<Bucket>,
    probe: AtomicUsize,
    descriptor: PoolDescriptor,
}

thread_local! {
    static LOCAL_BUFFERS: RefCell<Vec<(usize, Vec<usize>)>> = RefCell::new(Vec::new());
}

impl BinaryPoolMaster {
    pub fn new(parent: Arc<dyn Pool>, half_size: usize) -> Self {
        assert!(half_size.is_power_of_two());
        let parent_size = parent.describe().size;
        assert_eq!(parent_size, half_size * 2, "parent pool must hand out exactly 2N blocks");
        let table = (0..BUCKETS).map(|_| Bucket { spares: Mutex::new(Vec::new()) }).collect();
        BinaryPoolMaster {
            parent,
            half_size,
            table,
            probe: AtomicUsize::new(0),
            descriptor: PoolDescriptor {
                size: half_size,
                align: half_size,
                phase: 0,
                trace: half_size,
            },
        }
    }

    fn bucket(&self, base: usize) -> &Bucket {
        &self.table[hash_base(base) & (BUCKETS - 1)]
    }

    fn self_key(&self) -> usize {
        self as *const BinaryPoolMaster as usize
    }

    fn with_local<R>(&self, f: impl FnOnce(&mut Vec<usize>) -> R) -> R {
        let key = self.self_key();
        LOCAL_BUFFERS.with(|buffers| {
            let mut buffers = buffers.borrow_mut();
            if let Some(entry) = buffers.iter_mut().find(|(k, _)| *k == key) {
                f(&mut entry.1)
            } else {
                buffers.push((key, Vec::new()));
                f(&mut buffers.last_mut().unwrap().1)
            }
        })
    }

    /// Address of the `2N`-sized parent block a half at `addr` belongs to.
    fn base_of(&self, addr: usize) -> usize {
        let mask = (self.half_size * 2) - 1;
        addr & !mask
    }

    fn other_half(&self, base: usize, half_addr: usize) -> usize {
        if half_addr == base {
            base + self.half_size
        } else {
            base
        }
    }

    fn split_fresh(&self) -> Option<(usize, usize)> {
        let block = self.parent.map()?;
        let base = block.as_ptr() as usize;
        debug_assert_eq!(base & (self.half_size * 2 - 1), 0, "parent block must be 2N-aligned");
        Some((base, base + self.half_size))
    }
}

impl Pool for BinaryPoolMaster {
    fn describe(&self) -> PoolDescriptor {
        self.descriptor
    }

    fn map(&self) -> Option<NonNull<u8>> {
        // Thread-local ring first, to keep cross-thread traffic down.
        if let Some(addr) = self.with_local(|local| local.pop()) {
            return NonNull::new(addr as *mut u8);
        }

        let idx = self.probe.fetch_add(1, Ordering::Relaxed);
        let bucket = &self.table[idx & (BUCKETS - 1)];
        {
            let mut spares = bucket.spares.lock();
            if let Some(base) = spares.pop() {
                // The spare's literal half address is `base` (we always
                // store the *lower* half as the reusable spare; see
                // `unmap`/`split_fresh`).
                return NonNull::new(base as *mut u8);
            }
        }

        let (lower, upper) = self.split_fresh()?;
        // Hand out the upper half, park the lower half as a spare the
        // bucket can serve to the next `map()` or to `unmap`'s coalescing
        // check.
        self.bucket(lower).spares.lock().push(lower);
        NonNull::new(upper as *mut u8)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let base = self.base_of(addr);
        let bucket = self.bucket(base);
        let mut spares = bucket.spares.lock();
        if let Some(pos) = spares.iter().position(|&b| b == base) {
            // The other half of this pair is already parked waiting:
            // reunify and give the whole parent block back.
            spares.remove(pos);
            drop(spares);
            let full = NonNull::new_unchecked(base as *mut u8);
            self.parent.unmap(full);
            return;
        }
        drop(spares);

        // First of the pair to come back: try the thread-local ring
        // before falling back to the shared bucket, and batch ~1/4 of a
        // full ring back to the bucket on overflow.
        let pushed_back = self.with_local(|local| {
            if local.len() < THREAD_BUFFER_CAP {
                local.push(self.other_half(base, addr));
                true
            } else {
                false
            }
        });
        if pushed_back {
            return;
        }
        self.with_local(|local| {
            let drain = local.len() / 4;
            let mut overflow: Vec<usize> = local.drain(..drain.max(1)).collect();
            overflow.push(addr);
            for half in overflow {
                let b = self.base_of(half);
                self.bucket(b).spares.lock().push(self.other_half(b, half));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{StdVm, VmSource, REGION};

    struct FixedBlockPool {
        size: usize,
        vm: StdVm,
    }

    impl Pool for FixedBlockPool {
        fn describe(&self) -> PoolDescriptor {
            PoolDescriptor { size: self.size, align: self.size, phase: 0, trace: self.size }
        }
        fn map(&self) -> Option<NonNull<u8>> {
            self.vm.reserve(self.size.max(REGION))
        }
        unsafe fn unmap(&self, ptr: NonNull<u8>) {
            self.vm.release(ptr, self.size.max(REGION))
        }
    }

    #[test]
    fn map_unmap_releases_parent_only_after_both_halves_free() {
        let parent = Arc::new(FixedBlockPool { size: 128 * 1024, vm: StdVm });
        let master = BinaryPoolMaster::new(parent, 64 * 1024);
        let a = master.map().unwrap();
        let b = master.map().unwrap();
        assert_ne!(a, b);
        unsafe {
            master.unmap(a);
            master.unmap(b);
        }
    }

    #[test]
    fn reuses_spare_half_without_new_parent_allocation() {
        let parent = Arc::new(FixedBlockPool { size: 128 * 1024, vm: StdVm });
        let master = BinaryPoolMaster::new(parent, 64 * 1024);
        let a = master.map().unwrap();
        unsafe { master.unmap(a) };
        let b = master.map().unwrap();
        // Same address recycled from the thread-local ring or the bucket.
        assert_eq!(a, b);
    }
}
