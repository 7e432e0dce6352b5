//! A minimal concrete stand-in for `Request`/`Generator`-shaped async
//! completion primitives that calling code is assumed to already have.
//! Nothing outside this workspace actually supplies a concrete type for
//! them, so — exactly as `lightproc::light_proc` wraps `async-task`
//! instead of requiring an external `Task` impl — this module provides
//! the smallest `Future`-based completion object that satisfies that
//! contract (`spawn_all`, `fork`, `proxy`, and `bind` all return one of
//! these). It is modeled directly on `runtime_sync::timer::TimerRequest`:
//! an `Arc`-shared slot plus a waker, set once.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Inner<T> {
    slot: Mutex<Option<T>>,
    ready: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// The awaitable half. Resolves exactly once, when the paired
/// [`RequestSender`] completes it.
pub struct Request<T> {
    inner: Arc<Inner<T>>,
}

/// The completing half. `complete` is idempotent in the sense that only
/// the first call has any effect; callers that race to complete the same
/// request (e.g. `spawn_all`'s last-finisher) must arrange among
/// themselves that only one ever calls it, which every caller in this
/// crate does via an exactly-once atomic handoff.
pub struct RequestSender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestSender<T> {
    fn clone(&self) -> Self {
        RequestSender { inner: self.inner.clone() }
    }
}

/// Creates a bound `(sender, request)` pair, analogous to a one-shot
/// channel.
pub fn pair<T>() -> (RequestSender<T>, Request<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        ready: AtomicBool::new(false),
        waker: Mutex::new(None),
    });
    (RequestSender { inner: inner.clone() }, Request { inner })
}

impl<T> RequestSender<T> {
    pub fn complete(self, value: T) {
        if self.inner.ready.swap(true, Ordering::AcqRel) {
            return; // already completed; discard the late value
        }
        *self.inner.slot.lock().unwrap() = Some(value);
        if let Some(waker) = self.inner.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

impl<T> Future for Request<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if self.inner.ready.load(Ordering::Acquire) {
            if let Some(value) = self.inner.slot.lock().unwrap().take() {
                return Poll::Ready(value);
            }
            // Another poll already took the value; this Request is
            // single-consumer, so this path should be unreachable.
        }
        *self.inner.waker.lock().unwrap() = Some(cx.waker().clone());
        if self.inner.ready.load(Ordering::Acquire) {
            if let Some(value) = self.inner.slot.lock().unwrap().take() {
                return Poll::Ready(value);
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_before_poll_is_observed_immediately() {
        let (sender, request) = pair::<u32>();
        sender.complete(7);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut request = request;
        assert!(matches!(Pin::new(&mut request).poll(&mut cx), Poll::Ready(7)));
    }

    #[test]
    fn second_complete_is_ignored() {
        let (sender, request) = pair::<u32>();
        let sender2 = sender.clone();
        sender.complete(1);
        sender2.complete(2);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut request = request;
        assert!(matches!(Pin::new(&mut request).poll(&mut cx), Poll::Ready(1)));
    }

    fn noop_waker() -> Waker {
        use std::task::{RawWaker, RawWakerVTable};
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }
}
