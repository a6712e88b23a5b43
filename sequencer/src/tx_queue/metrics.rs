// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::TransactionQueue;

#[derive(Debug, Default)]
pub(super) struct QueueCounters {
    pub(super) enqueued: AtomicU64,
    pub(super) dequeued: AtomicU64,
    pub(super) rejected_full: AtomicU64,
    pub(super) rejected_size: AtomicU64,
    pub(super) moved_to_retry: AtomicU64,
    pub(super) retried: AtomicU64,
    pub(super) timed_out: AtomicU64,
}

impl QueueCounters {
    pub(super) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self, queue_len: usize, retry_len: usize) -> QueueMetrics {
        QueueMetrics {
            queue_len,
            retry_len,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            rejected_size: self.rejected_size.load(Ordering::Relaxed),
            moved_to_retry: self.moved_to_retry.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the queue counters. Counters are totals since start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    pub queue_len: usize,
    pub retry_len: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected_full: u64,
    pub rejected_size: u64,
    pub moved_to_retry: u64,
    pub retried: u64,
    pub timed_out: u64,
}

impl QueueMetrics {
    pub fn log(&self, final_window: bool) {
        info!(
            final_window,
            queue_len = self.queue_len,
            retry_len = self.retry_len,
            enqueued = self.enqueued,
            dequeued = self.dequeued,
            rejected_full = self.rejected_full,
            rejected_size = self.rejected_size,
            moved_to_retry = self.moved_to_retry,
            retried = self.retried,
            timed_out = self.timed_out,
            "transaction queue metrics"
        );
    }
}

/// Logs a metrics snapshot every `interval` until `cancel` fires, then logs a final one.
pub fn spawn_metrics_logger(
    queue: Arc<TransactionQueue>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => queue.metrics().log(false),
                _ = cancel.cancelled() => {
                    queue.metrics().log(true);
                    return;
                }
            }
        }
    })
}
