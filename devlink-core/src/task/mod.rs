//! Cooperative cancellation for long-running blocking calls.
//!
//! A [`CancellationToken`] wraps a shared "keep running" flag. Long loops
//! check it once per iteration; there is no way to interrupt a read that
//! is already blocked on the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct CancellationToken {
    running: Arc<AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// A fresh token that has not been cancelled.
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Adopt an existing run flag: the token counts as cancelled once the
    /// flag reads `false`.
    pub fn from_run_flag(running: Arc<AtomicBool>) -> Self {
        Self { running }
    }

    /// The shared run flag, for callers that store `false` themselves.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}
