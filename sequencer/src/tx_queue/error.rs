// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::Address;
use thiserror::Error;

/// Synchronous rejection at enqueue time; the transaction never enters a queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("transaction size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },
    #[error("queue is full")]
    QueueFull,
    #[error("invalid nonce: nonce overflow")]
    NonceOverflow,
    #[error("transaction queue closed")]
    Closed,
}

/// Terminal outcome delivered through a transaction's completion handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction cancelled")]
    Cancelled,
    #[error("transaction timed out in queue")]
    TimedOut,
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("nonce too low: sender={sender}, tx nonce={tx_nonce}, state nonce={state_nonce}")]
    NonceTooLow {
        sender: Address,
        tx_nonce: u64,
        state_nonce: u64,
    },
    #[error("{0}")]
    Rejected(String),
    #[error("forwarding failed: {0}")]
    Forward(String),
    #[error("sequencing failed: {0}")]
    Sequencing(String),
    #[error("sequencer not available")]
    NotAvailable,
    #[error("sequencer dropped the transaction")]
    Dropped,
}

impl TxError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn forward(message: impl Into<String>) -> Self {
        Self::Forward(message.into())
    }

    pub fn sequencing(message: impl Into<String>) -> Self {
        Self::Sequencing(message.into())
    }
}
