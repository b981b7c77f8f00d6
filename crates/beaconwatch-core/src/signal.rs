//! Cancellable wait shared between a worker loop and whoever stops it.
//!
//! A [`StopSignal`] replaces a plain `sleep` in periodic loops: the worker
//! calls [`StopSignal::wait_timeout`] and returns early as soon as another
//! thread calls [`StopSignal::stop`], so shutdown latency does not depend on
//! the loop interval.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot stop flag with an interruptible timed wait. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination and wake every waiter. Idempotent.
    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for up to `timeout`. Returns `true` if stop was requested
    /// before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
