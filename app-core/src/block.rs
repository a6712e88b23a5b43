// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{B256, Bytes};
use serde::{Deserialize, Serialize};

use crate::message::MessageWithMetadata;

/// Version byte leading every block metadata blob.
pub const BLOCK_METADATA_VERSION: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    /// Count of delayed inbox messages consumed up to and including this block.
    pub delayed_messages_read: u64,
    pub send_root: B256,
}

impl BlockHeader {
    /// Header of the block that would be built on top of `self`.
    ///
    /// The hash is unknown until the block is built and stays zero.
    pub fn pending_child(&self) -> Self {
        Self {
            number: self.number + 1,
            hash: B256::ZERO,
            parent_hash: self.hash,
            timestamp: self.timestamp,
            delayed_messages_read: self.delayed_messages_read,
            send_root: self.send_root,
        }
    }
}

/// A block produced and committed by the execution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltBlock {
    pub header: BlockHeader,
    pub tx_count: usize,
    pub call_data_units: u64,
    pub l1_gas_charged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResult {
    pub hash: B256,
    pub send_root: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMsg {
    pub msg_idx: u64,
    pub msg_with_meta: MessageWithMetadata,
    pub msg_result: MessageResult,
    pub block_metadata: Bytes,
}

impl SequencedMsg {
    pub fn from_built(msg_idx: u64, msg_with_meta: MessageWithMetadata, block: &BuiltBlock) -> Self {
        Self {
            msg_idx,
            msg_with_meta,
            msg_result: MessageResult {
                hash: block.header.hash,
                send_root: block.header.send_root,
            },
            block_metadata: block_metadata(block.tx_count),
        }
    }
}

/// Empty metadata blob: the version byte followed by one bit per transaction.
pub fn block_metadata(tx_count: usize) -> Bytes {
    let mut out = vec![0_u8; 1 + tx_count.div_ceil(8)];
    out[0] = BLOCK_METADATA_VERSION;
    out.into()
}
