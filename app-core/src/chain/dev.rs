// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::sync::Mutex;

use alloy_primitives::{Address, B256, keccak256};
use tracing::debug;

use super::{
    BlockBuilder, BuildError, BuildRequest, ChainError, ChainView, DecodeError, StateReader,
    TxDecoder,
};
use crate::block::{BlockHeader, BuiltBlock};
use crate::l2_tx::L2Transaction;
use crate::message::{L1MessageKind, MessageWithMetadata, parse_l2_message};

/// Sender address followed by the big-endian nonce.
pub const ENVELOPE_HEADER_LEN: usize = 20 + 8;

const ZERO_BYTE_CALLDATA_UNITS: u64 = 4;
const NONZERO_BYTE_CALLDATA_UNITS: u64 = 16;

#[derive(Debug, Clone, Copy)]
pub struct DevChainConfig {
    pub genesis_block_num: u64,
    pub genesis_timestamp: u64,
    pub l1_base_fee: u64,
}

impl Default for DevChainConfig {
    fn default() -> Self {
        Self {
            genesis_block_num: 0,
            genesis_timestamp: 0,
            l1_base_fee: 1,
        }
    }
}

/// In-memory chain that accepts every well-formed block on its head.
///
/// Transactions use a trivial envelope (`sender | nonce | payload`) instead of signed RLP.
/// Nonces are tracked per block so historical reads see the state they would on a real
/// node.
#[derive(Debug)]
pub struct DevChain {
    config: DevChainConfig,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    blocks: Vec<BlockHeader>,
    by_hash: HashMap<B256, usize>,
    nonces: HashMap<B256, HashMap<Address, u64>>,
    messages: Vec<MessageWithMetadata>,
    fail_next_build: Option<BuildError>,
}

impl DevChain {
    pub fn new(config: DevChainConfig) -> Self {
        let genesis = BlockHeader {
            number: config.genesis_block_num,
            hash: keccak256(config.genesis_block_num.to_be_bytes()),
            parent_hash: B256::ZERO,
            timestamp: config.genesis_timestamp,
            delayed_messages_read: 0,
            send_root: B256::ZERO,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, 0);
        let mut nonces = HashMap::new();
        nonces.insert(genesis.hash, HashMap::new());

        Self {
            config,
            inner: Mutex::new(Inner {
                blocks: vec![genesis],
                by_hash,
                nonces,
                messages: Vec::new(),
                fail_next_build: None,
            }),
        }
    }

    pub fn config(&self) -> DevChainConfig {
        self.config
    }

    /// Overrides the nonce of `address` at the current head.
    pub fn set_account_nonce(&self, address: Address, nonce: u64) {
        let mut inner = self.lock();
        let head_hash = inner.head().hash;
        inner
            .nonces
            .entry(head_hash)
            .or_default()
            .insert(address, nonce);
    }

    /// Makes the next `build_block` call fail with `error` without touching the chain.
    pub fn fail_next_build(&self, error: BuildError) {
        self.lock().fail_next_build = Some(error);
    }

    /// Messages of every block built so far, in chain order.
    pub fn messages(&self) -> Vec<MessageWithMetadata> {
        self.lock().messages.clone()
    }

    pub fn height(&self) -> u64 {
        self.lock().head().number
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("dev chain mutex poisoned")
    }
}

impl Default for DevChain {
    fn default() -> Self {
        Self::new(DevChainConfig::default())
    }
}

impl Inner {
    fn head(&self) -> &BlockHeader {
        // Genesis is inserted on construction and blocks are never removed.
        &self.blocks[self.blocks.len() - 1]
    }
}

impl ChainView for DevChain {
    fn head(&self) -> Result<BlockHeader, ChainError> {
        Ok(self.lock().head().clone())
    }

    fn header_by_hash(&self, hash: B256) -> Result<BlockHeader, ChainError> {
        let inner = self.lock();
        inner
            .by_hash
            .get(&hash)
            .map(|index| inner.blocks[*index].clone())
            .ok_or(ChainError::UnknownBlock(hash))
    }
}

impl StateReader for DevChain {
    fn account_nonce(&self, block: &BlockHeader, address: Address) -> Result<u64, ChainError> {
        let inner = self.lock();
        let snapshot = inner
            .nonces
            .get(&block.hash)
            .ok_or(ChainError::UnknownBlock(block.hash))?;
        Ok(snapshot.get(&address).copied().unwrap_or(0))
    }
}

impl TxDecoder for DevChain {
    fn decode_transaction(&self, raw: &[u8]) -> Result<L2Transaction, DecodeError> {
        decode_envelope(raw)
    }
}

impl BlockBuilder for DevChain {
    fn build_block(
        &self,
        parent: &BlockHeader,
        request: &BuildRequest,
    ) -> Result<BuiltBlock, BuildError> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_build.take() {
            return Err(error);
        }

        let head = inner.head().clone();
        if parent.hash != head.hash {
            return Err(BuildError::rejected(format!(
                "parent {} is not the chain head {}",
                parent.hash, head.hash
            )));
        }
        if request.number != head.number + 1 {
            return Err(BuildError::rejected(format!(
                "block number {} does not extend head {}",
                request.number, head.number
            )));
        }
        if request.message.delayed_messages_read < head.delayed_messages_read {
            return Err(BuildError::rejected(format!(
                "delayed messages read went backwards: {} < {}",
                request.message.delayed_messages_read, head.delayed_messages_read
            )));
        }

        let mut nonces = inner.nonces.get(&head.hash).cloned().unwrap_or_default();
        let message = &request.message.message;
        let mut tx_count = 0;
        let mut call_data_units = 0;

        if message.header.kind == L1MessageKind::L2Message {
            if let Some(l2_msg) = &message.l2_msg {
                let raw_txs =
                    parse_l2_message(l2_msg).map_err(|err| BuildError::rejected(err.to_string()))?;
                for raw in raw_txs {
                    let tx = decode_envelope(&raw)
                        .map_err(|err| BuildError::rejected(err.to_string()))?;
                    let expected = nonces.entry(tx.sender()).or_insert(0);
                    // Mismatched nonces are included but fail execution, like a real chain.
                    if tx.nonce() == *expected {
                        *expected += 1;
                    }
                    tx_count += 1;
                    call_data_units += calldata_units(&raw);
                }
            }
        }

        let hash = block_hash(&head, request);
        let header = BlockHeader {
            number: request.number,
            hash,
            parent_hash: head.hash,
            timestamp: head.timestamp.max(message.header.timestamp),
            delayed_messages_read: request.message.delayed_messages_read,
            send_root: keccak256([head.send_root.as_slice(), hash.as_slice()].concat()),
        };

        let index = inner.blocks.len();
        inner.blocks.push(header.clone());
        inner.by_hash.insert(hash, index);
        inner.nonces.insert(hash, nonces);
        inner.messages.push(request.message.clone());

        debug!(
            block_number = header.number,
            tx_count,
            delayed_messages_read = header.delayed_messages_read,
            "dev chain built block"
        );

        Ok(BuiltBlock {
            header,
            tx_count,
            call_data_units,
            l1_gas_charged: call_data_units.saturating_mul(self.config.l1_base_fee),
        })
    }
}

fn block_hash(parent: &BlockHeader, request: &BuildRequest) -> B256 {
    let message = &request.message.message;
    let mut preimage = Vec::with_capacity(128);
    preimage.extend_from_slice(parent.hash.as_slice());
    preimage.extend_from_slice(&request.number.to_be_bytes());
    preimage.extend_from_slice(&request.message.delayed_messages_read.to_be_bytes());
    preimage.push(message.header.kind.into());
    preimage.extend_from_slice(message.header.sender.as_slice());
    preimage.extend_from_slice(&message.header.timestamp.to_be_bytes());
    if let Some(request_id) = message.header.request_id {
        preimage.extend_from_slice(request_id.as_slice());
    }
    if let Some(l2_msg) = &message.l2_msg {
        preimage.extend_from_slice(l2_msg);
    }
    keccak256(preimage)
}

fn calldata_units(raw: &[u8]) -> u64 {
    raw.iter()
        .map(|byte| {
            if *byte == 0 {
                ZERO_BYTE_CALLDATA_UNITS
            } else {
                NONZERO_BYTE_CALLDATA_UNITS
            }
        })
        .sum()
}

fn decode_envelope(raw: &[u8]) -> Result<L2Transaction, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    if raw.len() < ENVELOPE_HEADER_LEN {
        return Err(DecodeError::TooShort {
            len: raw.len(),
            min: ENVELOPE_HEADER_LEN,
        });
    }
    let sender = Address::from_slice(&raw[..20]);
    let mut nonce = [0_u8; 8];
    nonce.copy_from_slice(&raw[20..ENVELOPE_HEADER_LEN]);
    Ok(L2Transaction::new(
        sender,
        u64::from_be_bytes(nonce),
        raw.to_vec(),
    ))
}

pub fn encode_envelope(sender: Address, nonce: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    out.extend_from_slice(sender.as_slice());
    out.extend_from_slice(&nonce.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Builds a transaction in the envelope format [`DevChain`] decodes.
pub fn dev_transaction(sender: Address, nonce: u64, payload: &[u8]) -> L2Transaction {
    L2Transaction::new(sender, nonce, encode_envelope(sender, nonce, payload))
}

#[cfg(test)]
mod tests {
    use super::{DevChain, calldata_units, dev_transaction, encode_envelope};
    use crate::chain::{
        BlockBuilder, BuildError, BuildRequest, ChainView, DecodeError, StateReader, TxDecoder,
    };
    use crate::message::assemble_user_transactions;
    use alloy_primitives::Address;

    #[test]
    fn decode_round_trips_envelope() {
        let chain = DevChain::default();
        let sender = Address::repeat_byte(0x42);
        let raw = encode_envelope(sender, 9, b"hello");
        let tx = chain.decode_transaction(&raw).expect("decode");
        assert_eq!(tx.sender(), sender);
        assert_eq!(tx.nonce(), 9);
        assert_eq!(tx.raw().as_ref(), raw.as_slice());

        assert_eq!(
            chain.decode_transaction(&[1, 2, 3]),
            Err(DecodeError::TooShort { len: 3, min: 28 })
        );
    }

    #[test]
    fn building_user_block_advances_head_and_nonces() {
        let chain = DevChain::default();
        let sender = Address::repeat_byte(0x01);
        let genesis = chain.head().expect("head");
        let txs = vec![
            dev_transaction(sender, 0, b"a"),
            dev_transaction(sender, 1, b"b"),
        ];
        let message = assemble_user_transactions(&txs, &genesis, 0);

        let built = chain
            .build_block(
                &genesis,
                &BuildRequest {
                    number: 1,
                    message,
                },
            )
            .expect("build block");

        assert_eq!(built.tx_count, 2);
        assert!(built.call_data_units > 0);
        assert_eq!(built.header.parent_hash, genesis.hash);
        assert_eq!(chain.head().expect("head"), built.header);
        assert_eq!(
            chain.account_nonce(&built.header, sender).expect("nonce"),
            2
        );
        assert_eq!(chain.account_nonce(&genesis, sender).expect("nonce"), 0);
    }

    #[test]
    fn stale_parent_is_rejected() {
        let chain = DevChain::default();
        let genesis = chain.head().expect("head");
        let message = assemble_user_transactions(
            &[dev_transaction(Address::repeat_byte(1), 0, b"x")],
            &genesis,
            0,
        );
        let request = BuildRequest { number: 1, message };
        chain.build_block(&genesis, &request).expect("first build");

        let err = chain
            .build_block(&genesis, &request)
            .expect_err("genesis is no longer head");
        assert!(matches!(err, BuildError::Rejected { .. }));
    }

    #[test]
    fn injected_failure_is_returned_once() {
        let chain = DevChain::default();
        chain.fail_next_build(BuildError::unavailable("restarting"));
        let genesis = chain.head().expect("head");
        let message = assemble_user_transactions(
            &[dev_transaction(Address::repeat_byte(1), 0, b"x")],
            &genesis,
            0,
        );
        let request = BuildRequest { number: 1, message };

        let err = chain.build_block(&genesis, &request).expect_err("injected");
        assert!(err.is_transient());
        chain.build_block(&genesis, &request).expect("second build");
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn calldata_units_weigh_zero_bytes_lower() {
        assert_eq!(calldata_units(&[0, 0, 1]), 4 + 4 + 16);
    }
}
