//! Tiered memory-affinity allocator: pool/heap managers and the affinity
//! graph that routes requests across them, built on the lock-free
//! monitor/timer primitives in `runtime_sync`.

pub mod affinity;
pub mod align;
pub mod binary_pool;
pub mod cyclic;
pub mod node_pool;
pub mod oom;
pub mod pool;
pub mod small_pool;
pub mod temporal;
pub mod trace;
pub mod vm;

pub use affinity::{
    Affinity, AffinityRegistry, BinaryMasterChain, InherentAffinity, Placement, PlatformAffinity, ProxyPool, TemporalBinding,
};
pub use align::{align_alloc, align_place, align_spec_of, unalign_alloc, AlignSpec, Model, Scale};
pub use binary_pool::BinaryPoolMaster;
pub use cyclic::CyclicPool;
pub use node_pool::{NodePool, NodePoolSync};
pub use oom::out_of_memory_die;
pub use pool::{Pool, PoolDescriptor};
pub use small_pool::NodeSmallPool;
pub use temporal::{TemporalAffinity, TemporalBase};
pub use trace::{DumpEscalation, ResourceTrace, VerifiedPool};
pub use vm::{StdVm, VmSource, HUGE_PAGE, REGION};
