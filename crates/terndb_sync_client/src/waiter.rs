//! Cross-thread completion waiters.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Pending,
    Done,
    Cancelled,
}

struct Shared {
    state: Mutex<WaitState>,
    signal: Condvar,
}

/// A one-shot completion signal shared between the service thread and
/// a caller thread.
///
/// The service thread resolves it exactly once; the caller blocks on
/// [`CompletionWaiter::wait`]. Deactivating the owning session cancels
/// outstanding waiters.
#[derive(Clone)]
pub struct CompletionWaiter {
    shared: Arc<Shared>,
}

impl CompletionWaiter {
    /// Creates a pending waiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WaitState::Pending),
                signal: Condvar::new(),
            }),
        }
    }

    /// Resolves the waiter successfully. Idempotent.
    pub fn complete(&self) {
        let mut state = self.shared.state.lock();
        if *state == WaitState::Pending {
            *state = WaitState::Done;
            self.shared.signal.notify_all();
        }
    }

    /// Cancels the waiter. Idempotent; a completed waiter stays
    /// completed.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if *state == WaitState::Pending {
            *state = WaitState::Cancelled;
            self.shared.signal.notify_all();
        }
    }

    /// True if the waiter has been resolved either way.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        *self.shared.state.lock() != WaitState::Pending
    }

    /// Blocks until resolution or `timeout`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] if the session deactivated,
    /// [`SyncError::WaitTimeout`] on timeout.
    pub fn wait(&self, timeout: Duration) -> SyncResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while *state == WaitState::Pending {
            if self
                .shared
                .signal
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        match *state {
            WaitState::Done => Ok(()),
            WaitState::Cancelled => Err(SyncError::Cancelled),
            WaitState::Pending => Err(SyncError::WaitTimeout),
        }
    }
}

impl Default for CompletionWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionWaiter")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
