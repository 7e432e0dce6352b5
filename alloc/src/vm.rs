//! The virtual-memory reservation/commit/decommit/release contract, an
//! external platform collaborator (platform syscall adapters for virtual
//! memory are out of scope here). This module is just the trait boundary
//! plus a `std::alloc`-backed
//! implementation good enough to back every pool in this crate without
//! this workspace owning raw `mmap`/`VirtualAlloc` code.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

pub const REGION: usize = 64 * 1024;
pub const HUGE_PAGE: usize = 2 * 1024 * 1024;

/// A source of raw memory regions. `reserve` hands back `bytes` (rounded
/// up to `REGION`) of fresh, zeroed memory; `release` returns it.
pub trait VmSource: Send + Sync {
    fn reserve(&self, bytes: usize) -> Option<NonNull<u8>>;
    fn release(&self, ptr: NonNull<u8>, bytes: usize);
    fn huge_page_alloc(&self) -> Option<NonNull<u8>>;
    fn huge_page_free(&self, ptr: NonNull<u8>);
}

fn region_layout(bytes: usize) -> Layout {
    let rounded = (bytes + REGION - 1) & !(REGION - 1);
    Layout::from_size_align(rounded.max(REGION), REGION).expect("valid region layout")
}

/// Default [`VmSource`] backed by the process's global allocator, aligned
/// to `REGION`/`HUGE_PAGE` boundaries so callers get the same placement
/// guarantees a real `mmap`-backed source would provide.
pub struct StdVm;

impl VmSource for StdVm {
    fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = region_layout(bytes);
        // Safety: layout is non-zero-sized (floored at REGION) and
        // power-of-two aligned.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
    }

    fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let layout = region_layout(bytes);
        // Safety: `ptr` was produced by `reserve` with the same `bytes`,
        // hence the same layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }

    fn huge_page_alloc(&self) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(HUGE_PAGE, HUGE_PAGE).ok()?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
    }

    fn huge_page_free(&self, ptr: NonNull<u8>) {
        let layout = Layout::from_size_align(HUGE_PAGE, HUGE_PAGE).expect("valid huge page layout");
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_round_trips() {
        let vm = StdVm;
        let ptr = vm.reserve(REGION).expect("reserve should succeed");
        vm.release(ptr, REGION);
    }
}
