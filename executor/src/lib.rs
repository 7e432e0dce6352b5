//! Work-stealing task scheduler: per-worker local queues, ordered
//! execution domains, `spawn_all` fan-out, `fork`, and cross-scheduler
//! `proxy`/`bind`, with hang detection and a periodic memory-dump
//! watchdog wired in.
//!
//! Builds on `lightproc` for the task/proc entity, `runtime_sync` for
//! monitors/condition variables and the timer queue, and `runtime_alloc`
//! for the affinity graph a scheduler's worker threads allocate through.

pub mod config;
pub mod hang;
pub mod local_queue;
pub mod memory_dump;
pub mod ordered_bucket;
pub mod request;
pub mod scheduler;
pub mod worker;

pub use config::{HangConfig, SchedulerConfig};
pub use hang::HangDetector;
pub use ordered_bucket::{OrderedBucket, OrderedBucketSet};
pub use request::Request;
pub use scheduler::{Fork, Priority, Scheduler, SpawnParam};
