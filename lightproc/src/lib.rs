//! Lock-free atomic primitives, a tagged pointer, and the `LightProc` task
//! abstraction the rest of this workspace schedules and allocates around.
//!
//! This crate covers atomic primitives, a flag-pointer, and the `Task`
//! entity itself. Everything above a single task's lifecycle — queues,
//! stealing, allocation — lives in the `executor` and `alloc` crates,
//! which depend on this one.

pub mod atomic;
pub mod light_proc;
pub mod proc_stack;
pub mod recoverable_handle;
pub mod tagged_ptr;

pub use atomic::Atomic;
pub use light_proc::LightProc;
pub use proc_stack::{ProcStack, Sample};
pub use recoverable_handle::RecoverableHandle;
pub use tagged_ptr::TaggedPtr;
