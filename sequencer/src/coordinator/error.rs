// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use app_core::chain::{BuildError, ChainError};
use thiserror::Error;

use crate::sequencer_state::ForwardError;

#[derive(Debug, Error)]
pub enum SequencingError {
    #[error("mutex held")]
    MutexHeld,
    #[error("chain read failed: {source}")]
    Chain {
        #[source]
        source: ChainError,
    },
    #[error("failed to build block {block_number}: {source}")]
    Build {
        block_number: u64,
        #[source]
        source: BuildError,
    },
    #[error("block {block_number} precedes genesis block {genesis_block_num}")]
    BeforeGenesis {
        block_number: u64,
        genesis_block_num: u64,
    },
    #[error("cannot forward: {source}")]
    Forward {
        #[source]
        source: ForwardError,
    },
}

impl From<ChainError> for SequencingError {
    fn from(source: ChainError) -> Self {
        Self::Chain { source }
    }
}

impl From<ForwardError> for SequencingError {
    fn from(source: ForwardError) -> Self {
        Self::Forward { source }
    }
}
