//! Fail-fast mutual exclusion for scheduler entry points.
//!
//! A scheduling round, the task assigner, and the state inspection calls
//! must never overlap. Contention is a caller bug, so the monitor refuses
//! entry instead of blocking.

use tokio::sync::{Mutex, MutexGuard};

use crate::SchedulerError;

/// Scoped, non-blocking mutual exclusion over scheduler state.
pub(crate) struct StateMonitor {
    lock: Mutex<()>,
}

impl StateMonitor {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Enter the monitor, or fail immediately if another entry is active.
    ///
    /// The returned guard releases the monitor on drop, including on error
    /// paths that unwind out of the caller.
    pub(crate) fn enter(&self) -> Result<StateGuard<'_>, SchedulerError> {
        self.lock
            .try_lock()
            .map(StateGuard)
            .map_err(|_| SchedulerError::ConcurrentAccess)
    }
}

/// Guard representing an active monitor entry.
pub(crate) struct StateGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_fails_while_guard_held() {
        let monitor = StateMonitor::new();

        let guard = monitor.enter().unwrap();
        assert!(matches!(
            monitor.enter(),
            Err(SchedulerError::ConcurrentAccess)
        ));

        drop(guard);
        assert!(monitor.enter().is_ok());
    }
}
