//! The task entity: a unit of work with an `execute` operation, metadata
//! for diagnostics, and ownership that moves from the caller to the
//! scheduler between spawn and completion.
//!
//! The CAS-based task state machine and reclamation behind it is not
//! hand-rolled here: `async-task` is exactly this primitive (a
//! `Runnable`/`Task` pair backed by an atomic refcounted state machine
//! with schedule-on-wake), and is already reached for by other
//! schedulers in this corpus. We wrap it rather than reimplement it
//! unsafely. See DESIGN.md.

use crate::proc_stack::ProcStack;
use crate::recoverable_handle::RecoverableHandle;
use async_task::{Builder, Runnable};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;

/// A schedulable unit of work. Owned by the scheduler from the moment
/// [`LightProc::schedule`] is first called until its `execute` future
/// resolves, at which point the paired [`RecoverableHandle`] observes the
/// result.
pub struct LightProc {
    runnable: Runnable<ProcStack>,
}

impl LightProc {
    /// Builds a task whose panics are caught rather than unwinding through
    /// the worker loop, pairing it with a [`RecoverableHandle`] the spawner
    /// can await (or drop to detach-and-ignore).
    ///
    /// `schedule` is invoked with the `LightProc` itself every time the
    /// task needs to run again (the initial run included — callers must
    /// call `.schedule()` once after creation to get it going, matching
    /// the spawn contract used throughout this workspace).
    pub fn recoverable<F, R, S>(future: F, schedule: S, stack: ProcStack) -> (LightProc, RecoverableHandle<R>)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
        S: Fn(LightProc) + Send + Sync + 'static,
    {
        let wrapped = CatchUnwind { inner: future };
        let (runnable, task) = Builder::new()
            .metadata(stack)
            .spawn(move |_meta: &ProcStack| wrapped, move |runnable| schedule(LightProc { runnable }));
        (LightProc { runnable }, RecoverableHandle::new(task))
    }

    /// Re-enters the scheduling closure supplied at creation, handing this
    /// task back to its owner (the scheduler's local queue, typically).
    pub fn schedule(self) {
        self.runnable.schedule();
    }

    /// Polls the task to completion of one `poll` call. Returns `true` if
    /// the task should be considered still alive (it may already have been
    /// rescheduled onto a queue by its own waker before `run` returns).
    pub fn run(self) -> bool {
        self.runnable.run()
    }

    pub fn metadata(&self) -> &ProcStack {
        self.runnable.metadata()
    }
}

impl std::fmt::Debug for LightProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightProc")
            .field("call_site", &self.metadata().call_site)
            .finish()
    }
}

/// Catches a panic inside `F`'s `poll` and turns it into `Err` instead of
/// unwinding through the executor. This is what makes a [`LightProc`]
/// "recoverable": one task panicking never takes a worker thread down.
struct CatchUnwind<F> {
    inner: F,
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = thread::Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we never move `inner` out; this is a standard pin
        // projection through a single-field wrapper.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        std::panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))).map_or_else(
            |payload| Poll::Ready(Err(payload)),
            |poll| poll.map(Ok),
        )
    }
}
