// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use alloy_primitives::B256;
use app_core::l2_tx::L2Transaction;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::TxError;

pub type TxOutcome = Result<B256, TxError>;

/// A transaction waiting for sequencing, owned by whichever queue or batch holds it.
#[derive(Debug)]
pub struct QueuedTransaction {
    tx: L2Transaction,
    size: usize,
    first_appearance: Instant,
    cancel: CancellationToken,
    respond_to: Option<oneshot::Sender<TxOutcome>>,
}

impl QueuedTransaction {
    pub(super) fn new(tx: L2Transaction, cancel: CancellationToken) -> (Self, TxHandle) {
        let (respond_to, rx) = oneshot::channel();
        let size = tx.encoded_len();
        let entry = Self {
            tx,
            size,
            first_appearance: Instant::now(),
            cancel: cancel.clone(),
            respond_to: Some(respond_to),
        };
        (entry, TxHandle { rx, cancel })
    }

    pub fn tx(&self) -> &L2Transaction {
        &self.tx
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn first_appearance(&self) -> Instant {
        self.first_appearance
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_timed_out(&self, threshold: Duration) -> bool {
        self.first_appearance.elapsed() > threshold
    }

    pub fn is_resolved(&self) -> bool {
        self.respond_to.is_none()
    }

    /// Resolves the handle. Only the first call has an effect; returns whether it did.
    pub fn return_result(&mut self, outcome: TxOutcome) -> bool {
        match self.respond_to.take() {
            Some(respond_to) => {
                // The submitter may have stopped waiting.
                let _ = respond_to.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolves as cancelled and trips the shared token.
    pub fn cancel(&mut self) -> bool {
        self.cancel.cancel();
        self.return_result(Err(TxError::Cancelled))
    }
}

/// Submitter side of a queued transaction.
#[derive(Debug)]
pub struct TxHandle {
    rx: oneshot::Receiver<TxOutcome>,
    cancel: CancellationToken,
}

impl TxHandle {
    /// Cancels the transaction; a sequencer that dequeues it afterwards drops it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Non-blocking peek. `None` while the transaction is still pending.
    pub fn try_outcome(&mut self) -> Option<TxOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TxError::Dropped)),
        }
    }

    pub async fn wait(self) -> TxOutcome {
        let Self { mut rx, cancel } = self;
        tokio::select! {
            biased;
            outcome = &mut rx => outcome.unwrap_or(Err(TxError::Dropped)),
            _ = cancel.cancelled() => Err(TxError::Cancelled),
        }
    }
}
