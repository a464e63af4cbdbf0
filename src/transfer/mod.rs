//! Bounded-concurrency chunk transfer
//!
//! A single [`TransferPool`] is shared by every snapshot and restore on the
//! host, so its semaphore caps total concurrent streams against the link.

mod backoff;
mod pool;

pub use backoff::ExponentialBackoff;
pub use pool::TransferPool;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag
///
/// Checked between files and chunks, never in the middle of a transfer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
