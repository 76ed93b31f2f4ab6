//! Fence sequencing and the device-wide completed counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{GpuError, Result};

/// Wraparound-aware "`a` was issued after `b`".
pub fn seqno_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// High-water mark of completed fence sequence numbers plus the wait queue
/// fence waiters sleep on.
#[derive(Debug)]
pub struct FenceTimeline {
    completed: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl FenceTimeline {
    pub fn new(completed: u32) -> Self {
        Self {
            completed: AtomicU32::new(completed),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// Moves the counter to `seqno` if it is newer. Returns whether it moved.
    pub fn advance(&self, seqno: u32) -> bool {
        let mut current = self.completed.load(Ordering::Acquire);
        loop {
            if !seqno_after(seqno, current) {
                return false;
            }
            match self.completed.compare_exchange_weak(
                current,
                seqno,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wakes every waiter so it re-checks its fence.
    pub(crate) fn wake_all(&self) {
        let _guard = self.guard();
        self.cond.notify_all();
    }

    fn wait_until(&self, deadline: Instant, done: impl Fn() -> bool) -> bool {
        let mut guard = self.guard();
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Issues sequence numbers. Lives inside the device-locked state, so issue
/// order is submission order.
#[derive(Debug)]
pub struct FenceSequencer {
    next: u32,
}

impl FenceSequencer {
    /// `completed` is the timeline's current value; the first fence gets the
    /// number after it.
    pub fn new(completed: u32) -> Self {
        Self {
            next: completed.wrapping_add(1),
        }
    }

    pub fn new_fence(&mut self, timeline: &Arc<FenceTimeline>) -> Fence {
        let seqno = self.next;
        self.next = self.next.wrapping_add(1);
        Fence::new(seqno, Arc::clone(timeline))
    }

    /// Sequence number of the most recently issued fence.
    pub fn last_issued(&self) -> u32 {
        self.next.wrapping_sub(1)
    }
}

type SignalCallback = Box<dyn FnOnce(Option<&GpuError>) + Send>;

#[derive(Default)]
struct FenceState {
    error: Option<GpuError>,
    callbacks: Vec<SignalCallback>,
}

struct FenceInner {
    seqno: u32,
    timeline: Arc<FenceTimeline>,
    signaled: AtomicBool,
    state: spin::Mutex<FenceState>,
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        trace!(seqno = self.seqno, "fence released");
    }
}

/// Waitable completion token for one submission. Cloning shares the fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    fn new(seqno: u32, timeline: Arc<FenceTimeline>) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                seqno,
                timeline,
                signaled: AtomicBool::new(false),
                state: spin::Mutex::new(FenceState::default()),
            }),
        }
    }

    pub fn seqno(&self) -> u32 {
        self.inner.seqno
    }

    /// Signaled either explicitly or because the completed counter has passed
    /// this fence. Lock-free.
    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
            || !seqno_after(self.inner.seqno, self.inner.timeline.completed())
    }

    /// Terminal error, set only when recovery resolved the fence.
    pub fn error(&self) -> Option<GpuError> {
        self.inner.state.lock().error.clone()
    }

    /// Blocks until the fence is signaled or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        if !self
            .inner
            .timeline
            .wait_until(deadline, || self.is_signaled())
        {
            return Err(GpuError::TimedOut);
        }
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs `cb` once when the fence is signaled, immediately if it already is.
    pub fn on_signal(&self, cb: impl FnOnce(Option<&GpuError>) + Send + 'static) {
        let mut state = self.inner.state.lock();
        if self.inner.signaled.load(Ordering::Acquire) {
            let error = state.error.clone();
            drop(state);
            cb(error.as_ref());
            return;
        }
        state.callbacks.push(Box::new(cb));
    }

    /// Records a terminal error unless the fence has already signaled.
    pub(crate) fn set_error(&self, err: GpuError) {
        if self.is_signaled() {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.error.is_none() {
            state.error = Some(err);
        }
    }

    /// Marks the fence signaled, runs callbacks and wakes waiters. Idempotent.
    pub(crate) fn signal(&self) {
        let (callbacks, error) = {
            let mut state = self.inner.state.lock();
            if self.inner.signaled.swap(true, Ordering::AcqRel) {
                return;
            }
            (std::mem::take(&mut state.callbacks), state.error.clone())
        };
        trace!(seqno = self.inner.seqno, "fence signaled");
        for cb in callbacks {
            cb(error.as_ref());
        }
        self.inner.timeline.wake_all();
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("seqno", &self.inner.seqno)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
