// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use alloy_primitives::B256;
use app_core::block::{BuiltBlock, SequencedMsg};
use serde::{Deserialize, Serialize};

use crate::tx_queue::{QueuedTransaction, TxError};

/// Backoff reported while this node is not the active sequencer.
pub const INACTIVE_WAIT: Duration = Duration::from_millis(50);
/// Backoff reported when there was nothing to sequence.
pub const MAX_BLOCK_SPEED: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub max_txs_per_block: usize,
    pub nonce_cache_size: usize,
    pub genesis_block_num: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_txs_per_block: 128,
            nonce_cache_size: 1024,
            genesis_block_num: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSequencingResult {
    pub sequenced_msg: Option<SequencedMsg>,
    pub wait_duration_ms: u64,
}

impl StartSequencingResult {
    pub(super) fn produced(msg: SequencedMsg) -> Self {
        Self {
            sequenced_msg: Some(msg),
            wait_duration_ms: 0,
        }
    }

    pub(super) fn idle(wait: Duration) -> Self {
        Self {
            sequenced_msg: None,
            wait_duration_ms: wait.as_millis() as u64,
        }
    }

    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_ms)
    }
}

/// What happens to a transaction after the coordinator has looked at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed(B256),
    Failed(TxError),
    Retry(String),
}

/// User transactions of a produced block, resolved when the cycle ends.
#[derive(Debug)]
pub(super) struct IncludedBatch {
    pub(super) block: BuiltBlock,
    pub(super) entries: Vec<QueuedTransaction>,
}

/// Last produced block, consumed by `append_last_sequenced_block`.
#[derive(Debug, Clone)]
pub(super) struct SequencedBlockInfo {
    pub(super) msg_idx: u64,
    pub(super) block: BuiltBlock,
    pub(super) from_delayed: bool,
}
