//! A join handle that turns a panicked task into `None` instead of
//! propagating the unwind to whoever is awaiting it.

use async_task::Task;
use crate::proc_stack::ProcStack;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Awaiting a [`RecoverableHandle`] yields `Some(R)` if the task's future
/// resolved normally, or `None` if it panicked. Dropping the handle
/// detaches the task: it keeps running to completion on the scheduler, its
/// result is simply discarded.
pub struct RecoverableHandle<R> {
    task: Task<std::thread::Result<R>, ProcStack>,
}

impl<R> RecoverableHandle<R> {
    pub(crate) fn new(task: Task<std::thread::Result<R>, ProcStack>) -> Self {
        RecoverableHandle { task }
    }

    /// Detaches the handle: the task keeps running, but nothing will ever
    /// observe its result.
    pub fn detach(self) {
        self.task.detach();
    }

    /// Requests cancellation. Drives the task once to try to complete it
    /// immediately if it is already finished; otherwise it is dropped from
    /// the scheduler the next time it would be polled.
    pub async fn cancel(self) -> Option<R> {
        self.task.cancel().await.and_then(|r| r.ok())
    }

    pub fn metadata(&self) -> &ProcStack {
        self.task.metadata()
    }
}

impl<R> Future for RecoverableHandle<R> {
    type Output = Option<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task = unsafe { self.map_unchecked_mut(|s| &mut s.task) };
        task.poll(cx).map(|res| res.ok())
    }
}

impl<R> fmt::Debug for RecoverableHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverableHandle").finish()
    }
}
