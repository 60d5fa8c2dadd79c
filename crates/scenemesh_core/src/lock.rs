//! The framework lock.
//!
//! Every public entry point of the connection layer takes this lock before
//! touching shared state, and upstream handlers are invoked with it held.
//! It is re-entrant so a handler may call back into the send API.

use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// Guard returned by [`FrameworkLock::lock`].
pub type FrameworkGuard<'a> = ReentrantMutexGuard<'a, ()>;

/// Cheaply cloneable handle to one process-wide re-entrant lock.
#[derive(Clone, Default)]
pub struct FrameworkLock {
    inner: Arc<ReentrantMutex<()>>,
}

impl FrameworkLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> FrameworkGuard<'_> {
        self.inner.lock()
    }

    /// Runs `f` with `guard` temporarily released.
    ///
    /// Used when joining a thread whose callbacks need the same lock.
    pub fn unlocked<T>(guard: &mut FrameworkGuard<'_>, f: impl FnOnce() -> T) -> T {
        ReentrantMutexGuard::unlocked(guard, f)
    }

    /// Whether both handles refer to the same lock.
    pub fn same_as(&self, other: &FrameworkLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for FrameworkLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameworkLock").finish_non_exhaustive()
    }
}
