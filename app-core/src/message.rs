// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! L1 inbox messages and the L2 message encoding used for sequenced user transactions.

use alloy_primitives::{Address, B256, Bytes, U256, address};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::BlockHeader;
use crate::l2_tx::L2Transaction;

/// Sender recorded on messages assembled by the sequencer itself.
pub const BATCH_POSTER_ADDRESS: Address = address!("0xa4b000000000000000000073657175656e636572");

/// Upper bound for a single length-prefixed segment inside a batch.
pub const MAX_L2_MESSAGE_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum L1MessageKind {
    L2Message,
    EndOfBlock,
    L2FundedByL1,
    RollupEvent,
    SubmitRetryable,
    BatchForGasEstimation,
    Initialize,
    EthDeposit,
    BatchPostingReport,
    Invalid,
}

impl From<L1MessageKind> for u8 {
    fn from(kind: L1MessageKind) -> Self {
        match kind {
            L1MessageKind::L2Message => 3,
            L1MessageKind::EndOfBlock => 6,
            L1MessageKind::L2FundedByL1 => 7,
            L1MessageKind::RollupEvent => 8,
            L1MessageKind::SubmitRetryable => 9,
            L1MessageKind::BatchForGasEstimation => 10,
            L1MessageKind::Initialize => 11,
            L1MessageKind::EthDeposit => 12,
            L1MessageKind::BatchPostingReport => 13,
            L1MessageKind::Invalid => 0xff,
        }
    }
}

impl TryFrom<u8> for L1MessageKind {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            3 => Self::L2Message,
            6 => Self::EndOfBlock,
            7 => Self::L2FundedByL1,
            8 => Self::RollupEvent,
            9 => Self::SubmitRetryable,
            10 => Self::BatchForGasEstimation,
            11 => Self::Initialize,
            12 => Self::EthDeposit,
            13 => Self::BatchPostingReport,
            0xff => Self::Invalid,
            other => return Err(MessageError::UnknownL1Kind(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum L2MessageKind {
    Batch = 3,
    SignedTx = 4,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown L1 message kind {0}")]
    UnknownL1Kind(u8),
    #[error("unsupported L2 message kind {0}")]
    UnsupportedL2Kind(u8),
    #[error("empty L2 message")]
    Empty,
    #[error("truncated L2 message segment: need {needed} bytes, have {available}")]
    Truncated { needed: u64, available: usize },
    #[error("L2 message segment too large: {0} bytes")]
    SegmentTooLarge(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1IncomingMessageHeader {
    pub kind: L1MessageKind,
    pub sender: Address,
    /// L1 block number the message was posted in.
    pub block_number: u64,
    pub timestamp: u64,
    pub request_id: Option<B256>,
    #[serde(rename = "baseFeeL1")]
    pub base_fee_l1: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1IncomingMessage {
    pub header: L1IncomingMessageHeader,
    pub l2_msg: Option<Bytes>,
    pub batch_gas_cost: Option<u64>,
}

impl L1IncomingMessage {
    /// Delayed inbox index carried in the request id, if any.
    ///
    /// Delayed messages encode their index big-endian in the last 8 bytes of the id.
    pub fn delayed_index(&self) -> Option<u64> {
        let request_id = self.header.request_id?;
        let mut tail = [0_u8; 8];
        tail.copy_from_slice(&request_id.as_slice()[24..]);
        Some(u64::from_be_bytes(tail))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWithMetadata {
    pub message: L1IncomingMessage,
    pub delayed_messages_read: u64,
}

/// One L1 inbox message together with its global delayed index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedMessage {
    pub message_index: u64,
    pub message: L1IncomingMessage,
}

/// Packs user transactions into an `L2Message` on top of `parent`.
///
/// The result does not consume any delayed message, so the parent's counter carries over.
pub fn assemble_user_transactions(
    transactions: &[L2Transaction],
    parent: &BlockHeader,
    l1_block_number: u64,
) -> MessageWithMetadata {
    let header = L1IncomingMessageHeader {
        kind: L1MessageKind::L2Message,
        sender: BATCH_POSTER_ADDRESS,
        block_number: l1_block_number,
        timestamp: parent.timestamp,
        request_id: None,
        base_fee_l1: U256::ZERO,
    };

    MessageWithMetadata {
        message: L1IncomingMessage {
            header,
            l2_msg: Some(encode_l2_message(transactions)),
            batch_gas_cost: None,
        },
        delayed_messages_read: parent.delayed_messages_read,
    }
}

fn encode_l2_message(transactions: &[L2Transaction]) -> Bytes {
    if let [single] = transactions {
        return encode_signed_tx(single).into();
    }

    let mut out = vec![L2MessageKind::Batch as u8];
    for tx in transactions {
        let inner = encode_signed_tx(tx);
        out.extend_from_slice(&(inner.len() as u64).to_be_bytes());
        out.extend_from_slice(&inner);
    }
    out.into()
}

fn encode_signed_tx(tx: &L2Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + tx.encoded_len());
    out.push(L2MessageKind::SignedTx as u8);
    out.extend_from_slice(tx.raw());
    out
}

/// Inverse of [`assemble_user_transactions`]: returns the raw transactions in order.
pub fn parse_l2_message(bytes: &[u8]) -> Result<Vec<Bytes>, MessageError> {
    let (&kind, body) = bytes.split_first().ok_or(MessageError::Empty)?;
    match kind {
        k if k == L2MessageKind::SignedTx as u8 => Ok(vec![Bytes::copy_from_slice(body)]),
        k if k == L2MessageKind::Batch as u8 => {
            let mut out = Vec::new();
            let mut rest = body;
            while !rest.is_empty() {
                if rest.len() < 8 {
                    return Err(MessageError::Truncated {
                        needed: 8,
                        available: rest.len(),
                    });
                }
                let (len_bytes, tail) = rest.split_at(8);
                let mut len_buf = [0_u8; 8];
                len_buf.copy_from_slice(len_bytes);
                let len = u64::from_be_bytes(len_buf);
                if len > MAX_L2_MESSAGE_SIZE {
                    return Err(MessageError::SegmentTooLarge(len));
                }
                if (tail.len() as u64) < len {
                    return Err(MessageError::Truncated {
                        needed: len,
                        available: tail.len(),
                    });
                }
                let (segment, next) = tail.split_at(len as usize);
                out.extend(parse_l2_message(segment)?);
                rest = next;
            }
            Ok(out)
        }
        other => Err(MessageError::UnsupportedL2Kind(other)),
    }
}
