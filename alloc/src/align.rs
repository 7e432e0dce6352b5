//! Alignment derivation: a pure function of `(size, phase)` that drives
//! which backing pool a request is routed to.

use std::mem::size_of;
use std::ptr::NonNull;

const WORD: usize = size_of::<usize>();
const CACHE_LINE: usize = 64;
const PAGE: usize = 4096;

/// Placement model: controls where within a block the user portion is
/// placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Model {
    /// Small enough to pack multiple allocations per cache line.
    Tiny,
    /// Placed at a cache-line-class offset.
    Line,
    /// Placed at a page-class offset.
    Page,
}

/// Backing-allocator choice: orthogonal to `Model`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    Line,
    Page,
    Unique,
}

#[derive(Clone, Copy, Debug)]
pub struct AlignSpec {
    pub size: usize,
    pub phase: usize,
    pub model: Model,
    pub scale: Scale,
    pub align_bytes: usize,
    pub alloc_bytes: usize,
    pub place_bytes: usize,
}

#[inline]
fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Derives the [`AlignSpec`] for a `(size, phase)` pair. `size` must be a
/// multiple of the machine word and `phase < size`; the user-visible
/// portion (`size - phase`) must be at least one word.
pub fn align_spec_of(size: usize, phase: usize) -> AlignSpec {
    assert_eq!(size % WORD, 0, "size must be a word multiple");
    assert!(phase < size, "phase must be smaller than size");
    let user = size - phase;
    assert!(user >= WORD, "user size must be at least one word");

    if user <= 56 {
        let align_bytes = if user % 16 == 0 { 16 } else { 8 };
        // Reserve a locator slot (the preceding-word raw-pointer stash
        // from `align_alloc`/`unalign_alloc`) plus one extra `align_bytes`
        // of slide room so `align_place` always has a congruent candidate
        // to land on regardless of `phase`.
        let alloc_bytes = align_up(size + WORD, align_bytes) + align_bytes;
        AlignSpec {
            size,
            phase,
            model: Model::Tiny,
            scale: Scale::Line,
            align_bytes,
            alloc_bytes,
            place_bytes: user,
        }
    } else {
        let is_page_multiple = user % PAGE == 0;
        let align_bytes = if is_page_multiple { PAGE } else { CACHE_LINE };
        let raw_alloc = align_up(size + WORD, align_bytes) + align_bytes;

        let (model, scale, alloc_bytes) = if raw_alloc < 16 * 1024 {
            (Model::Line, Scale::Line, raw_alloc)
        } else if raw_alloc < 256 * 1024 {
            (Model::Page, Scale::Page, raw_alloc)
        } else {
            (Model::Page, Scale::Unique, raw_alloc.next_power_of_two())
        };

        AlignSpec {
            size,
            phase,
            model,
            scale,
            align_bytes,
            alloc_bytes,
            place_bytes: user,
        }
    }
}

/// Computes an aligned placement for `spec`'s user portion within
/// `[free_begin, free_end)`. Returns `None` if it does not fit, or (for
/// the `Tiny` model) if no placement keeps the user bytes within a single
/// 64-byte cache line.
///
/// The user pointer must land on the smallest address `>= free_begin +
/// WORD` congruent to `-phase mod align_bytes`, not merely on any
/// `align_bytes` boundary: `(candidate + phase) % align_bytes == 0` only
/// coincides with `candidate % align_bytes == 0` when `phase` is itself a
/// multiple of `align_bytes`.
pub fn align_place(spec: &AlignSpec, free_begin: usize, free_end: usize) -> Option<usize> {
    if free_end.checked_sub(free_begin)? < spec.alloc_bytes {
        return None;
    }
    // Reserve one word ahead of the user pointer for the raw-pointer
    // locator slot written by `align_alloc`.
    let lower_bound = free_begin + WORD;
    let floor = align_up(lower_bound, spec.align_bytes);
    let target_residue = (spec.align_bytes - spec.phase % spec.align_bytes) % spec.align_bytes;
    let floor_residue = floor % spec.align_bytes;
    let step = (target_residue + spec.align_bytes - floor_residue) % spec.align_bytes;
    let candidate_user = floor + step;
    debug_assert_eq!((candidate_user + spec.phase) % spec.align_bytes, 0);
    let user_end = candidate_user + spec.place_bytes;
    if user_end > free_end {
        return None;
    }
    if spec.model == Model::Tiny {
        let line_start = candidate_user & !(CACHE_LINE - 1);
        let line_end = line_start + CACHE_LINE;
        if user_end > line_end {
            return None;
        }
    }
    Some(candidate_user)
}

/// Stores `raw` (the pointer actually returned by the backing allocator)
/// in the word preceding `user`, so [`unalign_alloc`] can recover it.
///
/// # Safety
/// `user - WORD` through `user` must be valid, writable memory owned by
/// the caller.
pub unsafe fn align_alloc(user: NonNull<u8>, raw: NonNull<u8>) {
    let locator = (user.as_ptr() as usize - WORD) as *mut usize;
    locator.write(raw.as_ptr() as usize);
}

/// Recovers the raw pointer stashed by [`align_alloc`].
///
/// # Safety
/// `user` must have been produced by a matching `align_alloc` call.
pub unsafe fn unalign_alloc(user: NonNull<u8>) -> NonNull<u8> {
    let locator = (user.as_ptr() as usize - WORD) as *const usize;
    NonNull::new_unchecked(locator.read() as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_model_for_small_sizes() {
        let spec = align_spec_of(64, 8);
        assert_eq!(spec.model, Model::Tiny);
        assert_eq!(spec.scale, Scale::Line);
    }

    #[test]
    fn page_multiple_user_size_gets_page_alignment() {
        let spec = align_spec_of(4096, 0);
        assert_eq!(spec.align_bytes, PAGE);
    }

    #[test]
    fn huge_sizes_become_unique_and_power_of_two() {
        let spec = align_spec_of(512 * 1024, 0);
        assert_eq!(spec.scale, Scale::Unique);
        assert!(spec.alloc_bytes.is_power_of_two());
    }

    #[test]
    #[should_panic(expected = "size must be a word multiple")]
    fn rejects_non_word_multiple_size() {
        align_spec_of(9, 0);
    }

    #[test]
    fn place_respects_phase_alignment() {
        let spec = align_spec_of(64, 8);
        let mut buf = vec![0u8; 4096];
        let base = buf.as_mut_ptr() as usize;
        let placed = align_place(&spec, base, base + buf.len()).unwrap();
        assert_eq!((placed + spec.phase) % spec.align_bytes, 0);
    }

    #[test]
    fn place_finds_congruent_offset_when_phase_not_a_multiple_of_align() {
        // phase=5 against align_bytes=64: no multiple-of-64 address also
        // satisfies (addr + 5) % 64 == 0, so this only works if the
        // search walks the full residue class rather than just rounding
        // up to the next align_bytes boundary.
        let spec = align_spec_of(128, 5);
        assert_eq!(spec.align_bytes, 64);
        let mut buf = vec![0u8; 4096];
        let base = buf.as_mut_ptr() as usize;
        let placed = align_place(&spec, base, base + buf.len()).unwrap();
        assert_eq!((placed + spec.phase) % spec.align_bytes, 0);
    }

    #[test]
    fn every_phase_residue_is_placeable_within_one_page_of_slack() {
        let mut buf = vec![0u8; 8192];
        let base = buf.as_mut_ptr() as usize;
        for phase in 0..63usize {
            let spec = align_spec_of(512, phase.min(511));
            assert!(
                align_place(&spec, base, base + buf.len()).is_some(),
                "phase {} should find a congruent placement given alloc_bytes slack",
                phase
            );
        }
    }
}
