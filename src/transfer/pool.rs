//! Semaphore-bounded transfer pool with per-item retry

use super::{CancelToken, ExponentialBackoff};
use crate::clock::Clock;
use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, warn};

pub struct TransferPool {
    permits: Semaphore,
    max_concurrent: usize,
    retry_attempts: u32,
    retry_base_delay_ms: u64,
    clock: Arc<dyn Clock>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl TransferPool {
    pub fn new(config: &SnapshotConfig, clock: Arc<dyn Clock>) -> Self {
        let max_concurrent = config.max_concurrent_transfers.max(1);
        TransferPool {
            permits: Semaphore::new(max_concurrent),
            max_concurrent,
            retry_attempts: config.retry_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
            clock,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Highest number of transfers observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Run one transfer under a permit, retrying transient failures
    ///
    /// Content-addressed transfers are idempotent, so a retried item never
    /// disturbs items that already succeeded.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("transfer pool closed".to_string()))?;

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let mut backoff = ExponentialBackoff::new(self.retry_base_delay_ms, self.retry_attempts);
        let result = loop {
            match op().await {
                Ok(value) => break Ok(value),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("Transfer failed, retrying in {:?}: {}", delay, e);
                        self.clock.sleep(delay).await;
                    }
                    None => {
                        error!("Transfer failed after max retries: {}", e);
                        break Err(e);
                    }
                },
                Err(e) => break Err(e),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Run a batch of transfers, at most `max_concurrent` at a time
    ///
    /// Results come back in input order. Items not yet started when the
    /// token is cancelled report `Cancelled`.
    pub async fn run_all<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        cancel: &CancelToken,
        op: F,
    ) -> Vec<Result<T>>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = &op;
        let transfers: Vec<_> = items
            .into_iter()
            .map(|item| async move {
                cancel.check()?;
                self.run(|| op(item.clone())).await
            })
            .collect();
        stream::iter(transfers)
            .buffered(self.max_concurrent)
            .collect()
            .await
    }
}
