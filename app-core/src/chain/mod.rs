// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Narrow interfaces to the execution layer.
//!
//! The sequencer never touches state or block production directly; it decides what goes
//! into the next block and hands it to a [`BlockBuilder`].

mod dev;

use alloy_primitives::{Address, B256};
use thiserror::Error;

use crate::block::{BlockHeader, BuiltBlock};
use crate::l2_tx::L2Transaction;
use crate::message::MessageWithMetadata;

pub use dev::{DevChain, DevChainConfig, ENVELOPE_HEADER_LEN, dev_transaction, encode_envelope};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unknown block {0}")]
    UnknownBlock(B256),
    #[error("chain unavailable: {reason}")]
    Unavailable { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("block rejected: {reason}")]
    Rejected { reason: String },
    #[error("block builder unavailable: {reason}")]
    Unavailable { reason: String },
}

impl BuildError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// True when the same input may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("transaction too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("empty transaction")]
    Empty,
}

/// Work item handed to the builder for block `number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub number: u64,
    pub message: MessageWithMetadata,
}

pub trait ChainView: Send + Sync {
    fn head(&self) -> Result<BlockHeader, ChainError>;

    fn header_by_hash(&self, hash: B256) -> Result<BlockHeader, ChainError>;
}

pub trait StateReader: ChainView {
    /// Next expected nonce of `address` after executing `block`.
    fn account_nonce(&self, block: &BlockHeader, address: Address) -> Result<u64, ChainError>;
}

pub trait BlockBuilder: Send + Sync {
    /// Builds and commits one block on top of `parent`.
    fn build_block(
        &self,
        parent: &BlockHeader,
        request: &BuildRequest,
    ) -> Result<BuiltBlock, BuildError>;
}

pub trait TxDecoder: Send + Sync {
    fn decode_transaction(&self, raw: &[u8]) -> Result<L2Transaction, DecodeError>;
}

/// Everything the sequencer needs from one execution client.
pub trait ExecutionChain: BlockBuilder + StateReader + TxDecoder {}

impl<T: BlockBuilder + StateReader + TxDecoder> ExecutionChain for T {}
