//! Readiness and shutdown signalling between the manager, filters and
//! their worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot readiness gate.
///
/// Packet handlers wait on this before touching their filter so that a
/// packet delivered while the filter is still being wired cannot observe
/// half-initialized state. After the first `signal` the wait is a single
/// atomic load.
#[derive(Clone, Default)]
pub struct ReadySignal {
    inner: Arc<ReadyInner>,
}

#[derive(Default)]
struct ReadyInner {
    ready: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark ready and wake all waiters. Idempotent.
    pub fn signal(&self) {
        self.inner.ready.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    /// Block until `signal` has been called.
    pub fn wait(&self) {
        if self.inner.ready.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.inner.lock.lock();
        while !self.inner.ready.load(Ordering::Acquire) {
            self.inner.cond.wait(&mut guard);
        }
    }
}

/// Cancellation flag shared by all background threads.
///
/// Worker loops poll `is_set`; periodic tasks sleep via `wait_timeout`
/// so that shutdown wakes them immediately instead of after their next
/// interval.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every sleeper. Idempotent.
    pub fn trigger(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Sleep for `timeout` or until shutdown, whichever comes first.
    /// Returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut guard = self.inner.lock.lock();
        if self.is_set() {
            return true;
        }
        let _ = self.inner.cond.wait_for(&mut guard, timeout);
        self.is_set()
    }
}
