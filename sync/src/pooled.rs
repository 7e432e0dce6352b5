//! Pooled monitor: hashes an owner pointer into a fixed, process-wide
//! table of lazily-constructed monitors instead of paying for a
//! dedicated allocation per owner. Table size is `(2*cores)^2`-class,
//! floored at 4096 entries (see
//! [`crate::config::pooled_monitor_table_size`]).

use crate::config::pooled_monitor_table_size;
use crate::monitor::{Level, Monitor, Policy};
use once_cell::sync::{Lazy, OnceCell};

struct Slot {
    cell: OnceCell<Monitor>,
}

impl Slot {
    const fn new() -> Self {
        Slot { cell: OnceCell::new() }
    }
}

struct PooledTable {
    slots: Vec<Slot>,
}

static TABLE: Lazy<PooledTable> = Lazy::new(|| {
    let size = pooled_monitor_table_size();
    PooledTable {
        slots: (0..size).map(|_| Slot::new()).collect(),
    }
});

fn hash_owner(owner: usize) -> usize {
    // FNV-1a, cheap and good enough for pointer-derived keys spread across
    // a power-of-two table.
    let mut hash: u64 = 0xcbf29ce484222325;
    let bytes = owner.to_ne_bytes();
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as usize
}

/// Returns the (lazily constructed) monitor for `owner`'s slot in the
/// static, process-wide pooled table.
pub fn monitor_for(owner: usize, policy: Policy) -> &'static Monitor {
    let idx = hash_owner(owner) & (TABLE.slots.len() - 1);
    TABLE.slots[idx]
        .cell
        .get_or_init(|| Monitor::new("pooled", Level::LEAF, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightproc::proc_stack::Sample;

    #[test]
    fn same_owner_returns_same_monitor() {
        let a = monitor_for(0x1000, Policy::AllowPriorityInversion) as *const Monitor;
        let b = monitor_for(0x1000, Policy::AllowPriorityInversion) as *const Monitor;
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_owners_can_still_be_entered_independently() {
        let m1 = monitor_for(1, Policy::AllowPriorityInversion);
        let m2 = monitor_for(2, Policy::AllowPriorityInversion);
        let _g1 = m1.enter(Sample::UNKNOWN, false);
        // If hashing collided onto the same slot this would still succeed
        // since it's the same underlying mutex either way (not a
        // correctness bug, just reduced concurrency) — here we just check
        // both slots are independently usable.
        if !std::ptr::eq(m1, m2) {
            let _g2 = m2.enter(Sample::UNKNOWN, false);
        }
    }
}
