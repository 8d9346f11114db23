// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Refresh Lock
// Mutual exclusion for token refresh with a forced release timer

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    /// Bumped on every acquisition; a release only applies to its own generation
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LockState>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Release the lock if `generation` still holds it. Safe to call repeatedly.
    fn release(&self, generation: u64) -> bool {
        let released = {
            let mut state = self.state();
            if state.held && state.generation == generation {
                state.held = false;
                true
            } else {
                false
            }
        };

        if released {
            self.notify.notify_waiters();
        }
        released
    }
}

/// Async lock whose holder is evicted after `timeout`.
///
/// A hung holder cannot block other callers forever. The holder's own release
/// after a forced release is a no-op and never frees a later holder's lock.
#[derive(Debug, Clone)]
pub struct RefreshLock {
    shared: Arc<Shared>,
    timeout: Duration,
}

impl RefreshLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LockState::default()),
                notify: Notify::new(),
            }),
            timeout,
        }
    }

    pub async fn acquire(&self) -> RefreshGuard {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(generation) = self.try_take() {
                return RefreshGuard {
                    shared: self.shared.clone(),
                    generation,
                    timer: Some(self.spawn_timer(generation)),
                };
            }

            notified.await;
        }
    }

    pub fn is_held(&self) -> bool {
        self.shared.state().held
    }

    fn try_take(&self) -> Option<u64> {
        let mut state = self.shared.state();
        if state.held {
            return None;
        }
        state.held = true;
        state.generation = state.generation.wrapping_add(1);
        Some(state.generation)
    }

    fn spawn_timer(&self, generation: u64) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if shared.release(generation) {
                warn!(
                    "Token refresh did not finish within {:?}, lock force-released",
                    timeout
                );
            }
        })
    }
}

/// Held refresh lock; released on drop
#[derive(Debug)]
pub struct RefreshGuard {
    shared: Arc<Shared>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl RefreshGuard {
    /// Whether this guard still owns the lock (false after a forced release)
    pub fn is_current(&self) -> bool {
        let state = self.shared.state();
        state.held && state.generation == self.generation
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if !self.shared.release(self.generation) {
            debug!("Refresh lock already released (generation {})", self.generation);
        }
    }
}
