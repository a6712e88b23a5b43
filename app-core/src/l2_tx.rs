// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_primitives::{Address, B256, Bytes, keccak256};

/// A user-submitted L2 transaction as seen by the sequencer.
///
/// The encoded form is opaque here; the execution layer decodes it (see
/// [`crate::chain::TxDecoder`]) and only the sender, nonce and raw bytes are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Transaction {
    sender: Address,
    nonce: u64,
    raw: Bytes,
    hash: B256,
}

impl L2Transaction {
    pub fn new(sender: Address, nonce: u64, raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        let hash = keccak256(&raw);
        Self {
            sender,
            nonce,
            raw,
            hash,
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// Size of the encoded transaction, used for admission limits.
    pub fn encoded_len(&self) -> usize {
        self.raw.len()
    }

    pub fn raw_hex(&self) -> String {
        alloy_primitives::hex::encode_prefixed(self.raw.as_ref())
    }
}
