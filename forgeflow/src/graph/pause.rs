//! Cooperative pause signal checked between stages.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// A token asking a running task to stop at the next stage boundary.
///
/// Pausing is idempotent and the first reason is kept. There is no
/// mid-stage interruption: a stage in flight always completes first.
#[derive(Default)]
pub struct PauseToken {
    paused: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl PauseToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a pause.
    pub fn pause(&self, reason: impl Into<String>) {
        if self
            .paused
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write() = Some(reason.into());
        }
    }

    /// Returns whether a pause was requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns the first pause reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Clears the token so it can be reused for a resumed run.
    pub fn clear(&self) {
        *self.reason.write() = None;
        self.paused.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PauseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseToken")
            .field("paused", &self.is_paused())
            .field("reason", &self.reason())
            .finish()
    }
}
