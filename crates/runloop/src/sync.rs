//! Synchronization primitives shared across the crate.
//!
//! Thin wrappers over `std::sync` that treat lock poisoning as fatal. A
//! panic while holding queue state leaves the loop unrecoverable, so
//! waiting callers panic too instead of limping on with torn state.

use std::sync;
use std::time::Duration;

pub(crate) type MutexGuard<'a, T> = sync::MutexGuard<'a, T>;

pub(crate) struct Mutex<T> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: sync::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it becomes available.
    ///
    /// # Panics
    ///
    /// Panics if the mutex has been poisoned by a panicking thread.
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().expect("mutex poisoned")
    }
}

pub(crate) struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub(crate) const fn new() -> Self {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.inner.wait(guard).expect("mutex poisoned")
    }

    /// Returns the reacquired guard and whether the wait timed out.
    pub(crate) fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = self
            .inner
            .wait_timeout(guard, timeout)
            .expect("mutex poisoned");
        (guard, result.timed_out())
    }

    pub(crate) fn notify_all(&self) {
        self.inner.notify_all();
    }
}
