//! Cooperative stop of the `watch` loop.
//!
//! A [`ShutdownSignal`] is shared between the loop, which waits on it between
//! refreshes, and whoever wants it to stop (a test, another thread).

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Stop flag waking up waiters as soon as it is raised.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    /// Create a signal with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop.
    pub fn request(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    #[allow(missing_docs)]
    pub fn is_requested(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`. Returns `true` when a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stop| !*stop)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
