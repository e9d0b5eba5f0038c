//! Cooperative cancellation for long units of work (KDF, commit).
//!
//! Cancellation is only observed at operation boundaries; work that is
//! interrupted is discarded, never surfaced half-done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ZilError, ZilResult};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Boundary check: `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> ZilResult<()> {
        if self.is_cancelled() {
            Err(ZilError::Cancelled)
        } else {
            Ok(())
        }
    }
}
