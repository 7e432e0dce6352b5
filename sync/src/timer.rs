//! Timer queue: a single dedicated thread drains newly posted timers,
//! sorts them by descending due-time, fires everything due within a
//! small activation window, and reports how long it can sleep before the
//! next `eval` is needed.
//!
//! New posts land on a [`crossbeam_queue::SegQueue`] — a lock-free MPMC
//! queue that plays the role of a lock-free singly-linked list via CAS
//! for the producer side; the eval loop drains it each pass instead of
//! swapping a sentinel in and CAS-ing it back, which is equivalent in
//! effect since `eval` is always re-entered by the same dedicated thread
//! (see DESIGN.md).

use crate::config::TimerConfig;
use crate::error::CoreError;
use lightproc::proc_stack::Sample;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

struct TimerState {
    due: Instant,
    caller: Sample,
    fired: AtomicBool,
    cancelled: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// A future that resolves `Ok(())` when the timer fires, or
/// `Err(CoreError::Cancelled)` if it is disposed first.
pub struct TimerRequest {
    state: Arc<TimerState>,
}

impl Future for TimerRequest {
    type Output = Result<(), CoreError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.cancelled.load(Ordering::Acquire) {
            return Poll::Ready(Err(CoreError::Cancelled));
        }
        if self.state.fired.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }
        *self.state.waker.lock().unwrap() = Some(cx.waker().clone());
        // Re-check after registering the waker to avoid a lost wakeup if
        // `eval` fired concurrently between our first load and the store.
        if self.state.fired.load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }
        if self.state.cancelled.load(Ordering::Acquire) {
            return Poll::Ready(Err(CoreError::Cancelled));
        }
        Poll::Pending
    }
}

impl TimerRequest {
    /// Disposes the timer before it fires. A no-op if it already fired.
    pub fn dispose(&self) {
        if !self.state.fired.load(Ordering::Acquire) {
            self.state.cancelled.store(true, Ordering::Release);
            if let Some(waker) = self.state.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }
}

pub struct TimerQueue {
    incoming: SegQueue<Arc<TimerState>>,
    active: Mutex<Vec<Arc<TimerState>>>,
    queued_count: AtomicUsize,
    wake_thunk: Box<dyn Fn() + Send + Sync>,
    config: TimerConfig,
}

impl TimerQueue {
    pub fn new(wake_thunk: impl Fn() + Send + Sync + 'static) -> Self {
        TimerQueue {
            incoming: SegQueue::new(),
            active: Mutex::new(Vec::new()),
            queued_count: AtomicUsize::new(0),
            wake_thunk: Box::new(wake_thunk),
            config: TimerConfig::default(),
        }
    }

    /// Creates and starts a timer that will fire `delay` from now.
    pub fn timer(&self, delay: Duration, caller: Sample) -> TimerRequest {
        let state = Arc::new(TimerState {
            due: Instant::now() + delay,
            caller,
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        self.incoming.push(state.clone());
        if self.queued_count.fetch_add(1, Ordering::AcqRel) == 0 {
            (self.wake_thunk)();
        }
        TimerRequest { state }
    }

    /// Drains newly posted timers, fires everything due, and returns how
    /// long the caller's dedicated timer thread may sleep before calling
    /// `eval` again.
    pub fn eval(&self) -> Duration {
        let mut active = self.active.lock().unwrap();
        while let Some(state) = self.incoming.pop() {
            self.queued_count.fetch_sub(1, Ordering::AcqRel);
            active.push(state);
        }
        // Descending by due: the earliest timer ends up at the tail so it
        // can be popped with `Vec::pop`.
        active.sort_by(|a, b| b.due.cmp(&a.due));

        let activate_time = Instant::now() + self.config.activate_slack;
        while let Some(last) = active.last() {
            if last.due <= activate_time {
                let state = active.pop().unwrap();
                Self::fire(&state);
            } else {
                break;
            }
        }

        match active.last() {
            Some(last) => {
                let remaining = last.due.saturating_duration_since(activate_time) + self.config.retry_margin;
                remaining.min(self.config.retry_default)
            }
            None => self.config.retry_default,
        }
    }

    fn fire(state: &Arc<TimerState>) {
        if state.cancelled.load(Ordering::Acquire) {
            return;
        }
        state.fired.store(true, Ordering::Release);
        tracing::trace!(caller = state.caller.0, "timer fired");
        if let Some(waker) = state.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap();
        while let Some(state) = self.incoming.pop() {
            active.push(state);
        }
        active.sort_by(|a, b| b.due.cmp(&a.due));
        // Soonest-first: iterate from the tail (earliest due) backward.
        while let Some(state) = active.pop() {
            state.cancelled.store(true, Ordering::Release);
            if let Some(waker) = state.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as AU;
    use std::sync::Arc as StdArc;

    #[test]
    fn timer_fires_after_eval_past_due() {
        let woken = StdArc::new(AU::new(0));
        let w = woken.clone();
        let queue = TimerQueue::new(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });
        let mut req = queue.timer(Duration::from_millis(1), Sample::UNKNOWN);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(5));
        queue.eval();
        let waker = futures_test_waker();
        let mut cx = Context::from_waker(&waker);
        let pinned = Pin::new(&mut req);
        assert!(matches!(pinned.poll(&mut cx), Poll::Ready(Ok(()))));
    }

    #[test]
    fn dispose_before_fire_cancels() {
        let queue = TimerQueue::new(|| {});
        let req = queue.timer(Duration::from_secs(10), Sample::UNKNOWN);
        req.dispose();
        let waker = futures_test_waker();
        let mut cx = Context::from_waker(&waker);
        let mut req = req;
        let pinned = Pin::new(&mut req);
        assert!(matches!(pinned.poll(&mut cx), Poll::Ready(Err(CoreError::Cancelled))));
    }

    #[test]
    fn eval_reports_retry_bounded_by_default() {
        let queue = TimerQueue::new(|| {});
        let retry = queue.eval();
        assert_eq!(retry, TimerConfig::default().retry_default);
    }

    fn futures_test_waker() -> Waker {
        use std::task::{RawWaker, RawWakerVTable};
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }
}
