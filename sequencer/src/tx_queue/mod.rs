// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Bounded queue of user transactions awaiting sequencing.
//!
//! Producers never block: admission is decided synchronously and the caller gets a
//! [`TxHandle`] that resolves once the sequencer has decided the transaction's fate.
//! Entries that must be tried again go to a retry queue that is always drained first.

mod error;
mod metrics;
mod queued;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use alloy_primitives::B256;
use app_core::l2_tx::L2Transaction;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use error::{AdmissionError, TxError};
pub use metrics::{QueueMetrics, spawn_metrics_logger};
pub use queued::{QueuedTransaction, TxHandle, TxOutcome};

use metrics::QueueCounters;

#[derive(Debug, Clone, Copy)]
pub struct TransactionQueueConfig {
    /// Combined capacity of the main and retry queues.
    pub max_queue_size: usize,
    pub queue_timeout: Duration,
    /// Zero disables the size check.
    pub max_tx_data_size: usize,
}

impl Default for TransactionQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1024,
            queue_timeout: Duration::from_secs(12),
            max_tx_data_size: 95_000,
        }
    }
}

#[derive(Debug, Default)]
struct Queues {
    main: VecDeque<QueuedTransaction>,
    retry: VecDeque<QueuedTransaction>,
    closed: bool,
}

impl Queues {
    fn len(&self) -> usize {
        self.main.len() + self.retry.len()
    }
}

#[derive(Debug)]
pub struct TransactionQueue {
    config: TransactionQueueConfig,
    queues: Mutex<Queues>,
    notify: Notify,
    counters: QueueCounters,
}

impl TransactionQueue {
    pub fn new(config: TransactionQueueConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            counters: QueueCounters::default(),
        }
    }

    pub fn config(&self) -> TransactionQueueConfig {
        self.config
    }

    pub fn enqueue_transaction(&self, tx: L2Transaction) -> Result<TxHandle, AdmissionError> {
        self.enqueue_transaction_with_cancel(tx, &CancellationToken::new())
    }

    /// Enqueues `tx` with a handle cancelled whenever `cancel` is.
    ///
    /// Cancelling the returned handle does not touch `cancel` itself.
    pub fn enqueue_transaction_with_cancel(
        &self,
        tx: L2Transaction,
        cancel: &CancellationToken,
    ) -> Result<TxHandle, AdmissionError> {
        let size = tx.encoded_len();
        if self.config.max_tx_data_size > 0 && size > self.config.max_tx_data_size {
            QueueCounters::bump(&self.counters.rejected_size);
            return Err(AdmissionError::Oversized {
                size,
                max: self.config.max_tx_data_size,
            });
        }
        if !Self::validate_transaction_nonce(&tx) {
            return Err(AdmissionError::NonceOverflow);
        }

        let hash = tx.hash();
        let (entry, handle) = QueuedTransaction::new(tx, cancel.child_token());
        {
            let mut queues = self.lock();
            if queues.closed {
                return Err(AdmissionError::Closed);
            }
            if queues.len() >= self.config.max_queue_size {
                QueueCounters::bump(&self.counters.rejected_full);
                return Err(AdmissionError::QueueFull);
            }
            queues.main.push_back(entry);
        }
        QueueCounters::bump(&self.counters.enqueued);
        self.notify.notify_one();

        debug!(tx_hash = %hash, size, "enqueued transaction");
        Ok(handle)
    }

    /// Enqueues and waits for the final outcome.
    ///
    /// Gives up after twice the queue timeout; the entry is then cancelled so the
    /// sequencer drops it when it gets there.
    pub async fn enqueue_and_wait(
        &self,
        tx: L2Transaction,
        cancel: &CancellationToken,
    ) -> TxOutcome {
        let handle = self.enqueue_transaction_with_cancel(tx, cancel)?;
        let entry_cancel = handle.cancel_token();
        let abort_after = self.config.queue_timeout.saturating_mul(2);
        match tokio::time::timeout(abort_after, handle.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                entry_cancel.cancel();
                Err(TxError::TimedOut)
            }
        }
    }

    /// Next entry, retry queue first.
    pub fn try_dequeue_transaction(&self) -> Option<QueuedTransaction> {
        let mut queues = self.lock();
        if let Some(entry) = queues.retry.pop_front() {
            QueueCounters::bump(&self.counters.retried);
            QueueCounters::bump(&self.counters.dequeued);
            return Some(entry);
        }
        let entry = queues.main.pop_front()?;
        QueueCounters::bump(&self.counters.dequeued);
        Some(entry)
    }

    /// Waits for an entry. Returns `None` once `cancel` fires.
    pub async fn dequeue_transaction(
        &self,
        cancel: &CancellationToken,
    ) -> Option<QueuedTransaction> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_dequeue_transaction() {
                return Some(entry);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Dequeues up to `max` entries without waiting.
    pub fn drain_batch(&self, max: usize) -> Vec<QueuedTransaction> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.try_dequeue_transaction() {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        out
    }

    pub fn complete_transaction(&self, mut entry: QueuedTransaction, hash: B256) {
        if entry.return_result(Ok(hash)) {
            debug!(tx_hash = %hash, "transaction completed");
        }
    }

    pub fn fail_transaction(&self, mut entry: QueuedTransaction, error: TxError) {
        if matches!(error, TxError::TimedOut) {
            QueueCounters::bump(&self.counters.timed_out);
        }
        let hash = entry.tx().hash();
        if entry.return_result(Err(error.clone())) {
            debug!(tx_hash = %hash, %error, "transaction failed");
        }
    }

    /// Puts `entry` back for another attempt; its handle stays pending.
    ///
    /// Retry pushes bypass the capacity check since the entry was already admitted.
    pub fn move_to_retry_queue(&self, entry: QueuedTransaction, reason: &str) {
        let hash = entry.tx().hash();
        self.lock().retry.push_back(entry);
        QueueCounters::bump(&self.counters.moved_to_retry);
        self.notify.notify_one();
        debug!(tx_hash = %hash, reason, "moved transaction to retry queue");
    }

    pub fn validate_transaction_nonce(tx: &L2Transaction) -> bool {
        tx.nonce() < u64::MAX
    }

    /// Cancels every queued entry and refuses new ones.
    pub fn close(&self) {
        let drained: Vec<QueuedTransaction> = {
            let mut queues = self.lock();
            queues.closed = true;
            let mut drained: Vec<_> = queues.retry.drain(..).collect();
            drained.extend(queues.main.drain(..));
            drained
        };
        let cancelled = drained.len();
        for mut entry in drained {
            entry.cancel();
        }
        self.notify.notify_waiters();
        debug!(cancelled, "transaction queue closed");
    }

    pub fn queue_len(&self) -> usize {
        self.lock().main.len()
    }

    pub fn retry_len(&self) -> usize {
        self.lock().retry.len()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let (queue_len, retry_len) = {
            let queues = self.lock();
            (queues.main.len(), queues.retry.len())
        };
        self.counters.snapshot(queue_len, retry_len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().expect("transaction queue mutex poisoned")
    }
}
