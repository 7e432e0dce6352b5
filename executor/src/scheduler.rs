//! The task scheduler core: per-worker local queues, work stealing,
//! ordered buckets, `spawn_all` fan-out, `fork`, and the cross-scheduler
//! `proxy`/`bind` plumbing.

use crate::config::SchedulerConfig;
use crate::hang::HangDetector;
use crate::local_queue::{steal_batch_into, ExternalQueue, LocalQueue, PeerHandle};
use crate::memory_dump;
use crate::ordered_bucket::{OrderedBucket, OrderedBucketSet};
use crate::request::{self, Request};
use crate::worker;
use lightproc::proc_stack::{ProcStack, Sample};
use lightproc::recoverable_handle::RecoverableHandle;
use lightproc::LightProc;
use once_cell::sync::OnceCell;
use runtime_alloc::{Affinity, AffinityRegistry};
use runtime_sync::condvar::ConditionVar;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// `SpawnParam` is immutable once passed, and routes a spawn to an
/// ordered bucket or to the ordinary local/external path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    NewWork,
    ExistingWork,
}

#[derive(Clone, Debug)]
pub struct SpawnParam {
    pub queue: Option<Arc<str>>,
    pub priority: Priority,
}

impl SpawnParam {
    pub fn new_work() -> Self {
        SpawnParam { queue: None, priority: Priority::NewWork }
    }

    pub fn existing_work() -> Self {
        SpawnParam { queue: None, priority: Priority::ExistingWork }
    }

    /// A spawn destined for a named ordered bucket. Ordered spawns must
    /// use `NewWork` priority; `Scheduler::spawn` asserts this in debug
    /// builds.
    pub fn ordered(name: impl Into<Arc<str>>) -> Self {
        SpawnParam { queue: Some(name.into()), priority: Priority::NewWork }
    }
}

struct WorkerContext {
    scheduler_id: u64,
    index: usize,
    worker: LocalQueue,
    /// Set for the duration of running a task popped from an ordered
    /// bucket; spawns issued while set redirect to `ordered_spawns`
    /// instead of this worker's own local queue.
    ordered: Cell<bool>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = RefCell::new(None);
}

enum Route {
    OrderedRedirect,
    Worker(usize),
    Other,
}

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// A work-stealing task scheduler. Construct with [`Scheduler::new`],
/// start workers with [`Scheduler::service_start`].
pub struct Scheduler {
    id: u64,
    config: SchedulerConfig,
    peers: Vec<OnceCell<PeerHandle>>,
    peers_used: AtomicUsize,
    ordered_set: OrderedBucketSet,
    ordered_spawns: OrderedBucket,
    external_queue: ExternalQueue,
    idle_cvar: ConditionVar,
    awake: AtomicUsize,
    shutdown: AtomicBool,
    affinity: Arc<dyn Affinity>,
    hang: Arc<HangDetector>,
    threads: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    memory_dump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Scheduler> {
        let peers_capacity = config.peers_capacity;
        let hang = Arc::new(HangDetector::new(config.hang));
        Arc::new(Scheduler {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            peers: (0..peers_capacity).map(|_| OnceCell::new()).collect(),
            peers_used: AtomicUsize::new(0),
            ordered_set: OrderedBucketSet::new(),
            ordered_spawns: OrderedBucket::new(),
            external_queue: ExternalQueue::new(),
            idle_cvar: ConditionVar::new(Sample::UNKNOWN),
            awake: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            affinity: AffinityRegistry::new().bind(0),
            hang,
            threads: parking_lot::Mutex::new(Vec::new()),
            memory_dump: parking_lot::Mutex::new(None),
        })
    }

    pub fn default_param(&self) -> SpawnParam {
        SpawnParam::existing_work()
    }

    pub fn affinity(&self) -> &Arc<dyn Affinity> {
        &self.affinity
    }

    pub fn hang_detector(&self) -> &Arc<HangDetector> {
        &self.hang
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn signal_if_under_threshold(&self) {
        if self.awake.load(Ordering::Acquire) < self.config.peek_threshold {
            self.idle_cvar.signal(false);
        }
    }

    fn decide_route(&self, priority: Priority) -> Route {
        CURRENT.with(|cell| {
            let borrow = cell.borrow();
            match borrow.as_ref() {
                Some(ctx) if ctx.scheduler_id == self.id && priority == Priority::ExistingWork => {
                    if ctx.ordered.get() {
                        Route::OrderedRedirect
                    } else {
                        Route::Worker(ctx.index)
                    }
                }
                _ => Route::Other,
            }
        })
    }

    /// Routes `task` to this worker's local queue, the external queue, or
    /// an ordered-bucket redirect, according to `param`.
    pub fn spawn(&self, task: LightProc, param: SpawnParam, call_site: Sample) {
        let _ = call_site;
        if self.shutdown.load(Ordering::Acquire) {
            task.run();
            return;
        }

        if let Some(name) = param.queue.as_deref() {
            debug_assert_eq!(
                param.priority,
                Priority::NewWork,
                "ordered-bucket spawns require Priority::NewWork"
            );
            if self.ordered_set.push(name, task) {
                self.signal_if_under_threshold();
            }
            return;
        }

        match self.decide_route(param.priority) {
            Route::OrderedRedirect => {
                self.ordered_spawns.push(task);
            }
            Route::Worker(index) => {
                CURRENT.with(|cell| {
                    let borrow = cell.borrow();
                    borrow.as_ref().expect("route decided Worker(_) under this thread's context").worker.push(task);
                });
                if let Some(peer) = self.peers[index].get() {
                    if peer.stat.record_spawn() {
                        self.signal_if_under_threshold();
                    }
                }
            }
            Route::Other => {
                self.external_queue.push(task);
                self.signal_if_under_threshold();
            }
        }
    }

    /// Re-enters the scheduler for a task that's already been built
    /// (async-task's schedule-on-wake callback). Treated as an
    /// `ExistingWork` spawn.
    pub(crate) fn reschedule(&self, task: LightProc) {
        let site = task.metadata().call_site;
        self.spawn(task, SpawnParam::existing_work(), site);
    }

    /// Builds and spawns a fresh future, stamping its `ProcStack` at
    /// creation, since a [`LightProc`]'s metadata is immutable once
    /// built — every task is *created* through this path rather than
    /// mutated after the fact.
    pub fn spawn_future<F>(self: &Arc<Self>, future: F, param: SpawnParam, call_site: Sample) -> RecoverableHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut stack = ProcStack::new(call_site);
        stack.stamp_enqueue();
        let scheduler = Arc::downgrade(self);
        let (proc, handle) = LightProc::recoverable(
            future,
            move |p| {
                if let Some(s) = scheduler.upgrade() {
                    s.reschedule(p);
                }
            },
            stack,
        );
        self.spawn(proc, param, call_site);
        handle
    }

    /// Runs one replica of `task` on every currently-registered peer
    /// worker, completing once every replica has run.
    pub fn spawn_all<F, Fut>(self: &Arc<Self>, task: F, call_site: Sample) -> Request<usize>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let peers_used = self.peers_used.load(Ordering::Acquire).max(1);
        let (sender, req) = request::pair::<usize>();
        let remaining = Arc::new(AtomicUsize::new(peers_used));
        let task = Arc::new(task);

        for index in 0..peers_used {
            let task = task.clone();
            let remaining = remaining.clone();
            let sender = sender.clone();
            let scheduler = Arc::downgrade(self);
            let mut stack = ProcStack::new(call_site);
            stack.stamp_enqueue();
            let (proc, handle) = LightProc::recoverable(
                async move {
                    (task)().await;
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        sender.complete(peers_used);
                    }
                },
                move |p| {
                    if let Some(s) = scheduler.upgrade() {
                        s.reschedule(p);
                    }
                },
                stack,
            );
            handle.detach();
            if let Some(peer) = self.peers[index].get() {
                peer.queue_all.push(proc);
            } else {
                // No peer registered at this index (service not started,
                // or fewer workers than `peers_used` implies): fall back
                // to the external queue so the replica still runs once.
                self.external_queue.push(proc);
            }
        }
        self.signal_all();
        req
    }

    /// Returns a generator whose `next()` spawns one more replica of
    /// `entry`, resolving to whether that replica's completion brought
    /// the outstanding count to zero.
    pub fn fork<T, F>(self: &Arc<Self>, entry: F) -> Fork<T>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Fork { scheduler: self.clone(), entry: Arc::new(entry), remaining: Arc::new(AtomicUsize::new(0)) }
    }

    /// Runs `inner` to completion on `target`, then completes the
    /// returned request back on `self`.
    pub fn proxy<T, Fut>(self: &Arc<Self>, target: &Arc<Scheduler>, inner: Fut, param: SpawnParam, call_site: Sample) -> Request<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (sender, req) = request::pair::<T>();
        let caller = self.clone();
        target.spawn_future(
            async move {
                let result = inner.await;
                caller.spawn_future(async move { sender.complete(result) }, caller.default_param(), call_site).detach();
            },
            param,
            call_site,
        ).detach();
        req
    }

    /// Re-executes `inner`'s completion on this scheduler.
    pub fn bind<T, Fut>(self: &Arc<Self>, inner: Fut, call_site: Sample) -> Request<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (sender, req) = request::pair::<T>();
        let param = self.default_param();
        self.spawn_future(
            async move {
                let result = inner.await;
                sender.complete(result);
            },
            param,
            call_site,
        )
        .detach();
        req
    }

    fn signal_all(&self) {
        self.idle_cvar.signal(true);
    }

    /// Forks one worker thread per core.
    pub fn service_start(self: &Arc<Self>) {
        let worker_count = SchedulerConfig::worker_count();
        let mut threads = self.threads.lock();
        for _ in 0..worker_count {
            let scheduler = self.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("runtime-worker".into())
                    .spawn(move || worker::run(scheduler))
                    .expect("failed to spawn worker thread"),
            );
        }
        self.awake.store(worker_count, Ordering::Release);
        drop(threads);

        let scheduler = self.clone();
        *self.memory_dump.lock() = Some(memory_dump::spawn_watcher(scheduler));
    }

    /// Sets the shutdown flag, wakes every worker permanently, and waits
    /// for them to exit.
    /// Does not join the thread that issued the stop, since that may be
    /// one of the workers being stopped.
    pub fn service_stop(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Release);
        self.signal_all();
        let me = std::thread::current().id();
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        if let Some(handle) = self.memory_dump.lock().take() {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    pub(crate) fn register_peer(&self, local: &LocalQueue) -> usize {
        let index = self.peers_used.fetch_add(1, Ordering::AcqRel);
        assert!(index < self.peers.len(), "peers_capacity exceeded");
        self.peers[index]
            .set(PeerHandle::new(local.stealer()))
            .unwrap_or_else(|_| panic!("peer slot {index} already registered"));
        index
    }

    pub(crate) fn peer(&self, index: usize) -> Option<&PeerHandle> {
        self.peers[index].get()
    }

    pub(crate) fn peers_used(&self) -> usize {
        self.peers_used.load(Ordering::Acquire)
    }

    pub(crate) fn ordered_set(&self) -> &OrderedBucketSet {
        &self.ordered_set
    }

    pub(crate) fn ordered_spawns(&self) -> &OrderedBucket {
        &self.ordered_spawns
    }

    pub(crate) fn external_queue(&self) -> &ExternalQueue {
        &self.external_queue
    }

    pub(crate) fn idle_cvar(&self) -> &ConditionVar {
        &self.idle_cvar
    }

    pub(crate) fn awake(&self) -> &AtomicUsize {
        &self.awake
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Binds the current OS thread to `index` in this scheduler's worker
    /// set for the duration of `body`, i.e. spawns routed `ExistingWork`
    /// from inside `body` land on this worker's own local queue.
    pub(crate) fn bind_current_thread<R>(self: &Arc<Self>, index: usize, local: LocalQueue, body: impl FnOnce() -> R) -> R {
        let ctx = WorkerContext { scheduler_id: self.id, index, worker: local, ordered: Cell::new(false) };
        CURRENT.with(|cell| *cell.borrow_mut() = Some(ctx));
        let result = body();
        CURRENT.with(|cell| *cell.borrow_mut() = None);
        result
    }

    pub(crate) fn with_local_queue<R>(&self, f: impl FnOnce(&LocalQueue) -> R) -> R {
        CURRENT.with(|cell| {
            let borrow = cell.borrow();
            let ctx = borrow.as_ref().expect("called outside a bound worker thread");
            f(&ctx.worker)
        })
    }

    pub(crate) fn steal_into_current(&self, stealer: &crossbeam_deque::Stealer<LightProc>, max: usize) -> usize {
        CURRENT.with(|cell| {
            let borrow = cell.borrow();
            let ctx = borrow.as_ref().expect("called outside a bound worker thread");
            steal_batch_into(stealer, &ctx.worker, max)
        })
    }

    pub(crate) fn set_ordered_flag(&self, value: bool) {
        CURRENT.with(|cell| {
            let borrow = cell.borrow();
            if let Some(ctx) = borrow.as_ref() {
                ctx.ordered.set(value);
            }
        });
    }
}

/// A generator returned by [`Scheduler::fork`]; each `next()` call spawns
/// one more replica of the fork's entry point.
pub struct Fork<T> {
    scheduler: Arc<Scheduler>,
    entry: Arc<dyn Fn() -> T + Send + Sync>,
    remaining: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Fork<T> {
    /// Spawns one more replica. The returned handle resolves to `true`
    /// once this replica's completion brings the generator's outstanding
    /// count back to zero.
    pub fn next(&self, param: SpawnParam, call_site: Sample) -> RecoverableHandle<bool> {
        self.remaining.fetch_add(1, Ordering::AcqRel);
        let entry = self.entry.clone();
        let remaining = self.remaining.clone();
        self.scheduler.spawn_future(
            async move {
                (entry)();
                remaining.fetch_sub(1, Ordering::AcqRel) == 1
            },
            param,
            call_site,
        )
    }

    pub fn outstanding(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_before_service_start_lands_on_external_queue() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.spawn_future(async { 1u32 }, scheduler.default_param(), Sample::UNKNOWN).detach();
        assert!(!scheduler.external_queue.is_empty());
    }

    #[test]
    fn ordered_param_requires_new_work_priority_in_debug() {
        let param = SpawnParam::ordered("log");
        assert_eq!(param.priority, Priority::NewWork);
    }

    #[test]
    fn shutdown_runs_spawns_inline() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.shutdown.store(true, Ordering::Release);
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        scheduler
            .spawn_future(
                async move {
                    r.store(true, Ordering::SeqCst);
                },
                scheduler.default_param(),
                Sample::UNKNOWN,
            )
            .detach();
        assert!(ran.load(Ordering::SeqCst));
    }
}
