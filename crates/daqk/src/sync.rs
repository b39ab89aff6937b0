//! Locking primitives shared by every kernel structure.
//!
//! Wraps `parking_lot` so that `lock()` never yields a poison error. A panic
//! inside a critical section is a contract violation and is not recovered
//! from, so poisoning carries no information worth propagating.

pub use parking_lot::Condvar;
pub use std::sync::{Arc, Weak};

pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Mutex used for node state, unit queues and loop scheduling state.
#[derive(Default)]
pub struct Mutex<T> {
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given value.
    pub fn new(value: T) -> Self {
        Self {
            inner: parking_lot::Mutex::new(value),
        }
    }

    /// Acquires the mutex, blocking until it becomes available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Acquires the mutex only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Runs `f` with the guard temporarily released and relocks afterwards.
///
/// Used wherever a lock must not be held while entering another object's
/// lock scope.
pub fn unlocked<T, R>(guard: &mut MutexGuard<'_, T>, f: impl FnOnce() -> R) -> R {
    parking_lot::MutexGuard::unlocked(guard, f)
}
