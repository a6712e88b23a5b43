// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::num::NonZeroUsize;

use alloy_primitives::{Address, B256};
use app_core::block::BlockHeader;
use app_core::chain::{ChainError, StateReader};
use lru::LruCache;
use tracing::trace;

/// LRU of next-expected nonces, valid along one linear extension of the chain.
///
/// Lookups take the header of the block being built. Entries are only trusted while that
/// header's parent is the block the cache was last finalized against, or while it is the
/// very header the cache was last updated for.
#[derive(Debug)]
pub struct NonceCache {
    cache: LruCache<Address, u64>,
    position: B256,
    dirty: Option<BlockHeader>,
}

impl NonceCache {
    pub fn new(size: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)),
            position: B256::ZERO,
            dirty: None,
        }
    }

    /// Starts prechecking a new block.
    ///
    /// Updates left over from a block that was never finalized cannot be trusted, so a
    /// dirty cache is dropped entirely.
    pub fn begin_new_block(&mut self) {
        if self.dirty.is_some() {
            self.reset(B256::ZERO);
        }
    }

    pub fn get<R: StateReader + ?Sized>(
        &mut self,
        header: &BlockHeader,
        reader: &R,
        address: Address,
    ) -> Result<u64, ChainError> {
        if !self.matches(header) {
            self.reset(header.parent_hash);
        }
        if let Some(nonce) = self.cache.get(&address) {
            return Ok(*nonce);
        }

        let parent = reader.header_by_hash(header.parent_hash)?;
        let nonce = reader.account_nonce(&parent, address)?;
        self.cache.put(address, nonce);
        Ok(nonce)
    }

    pub fn update(&mut self, header: &BlockHeader, address: Address, nonce: u64) {
        if !self.matches(header) {
            self.reset(header.parent_hash);
        }
        self.dirty = Some(header.clone());
        self.cache.put(address, nonce);
    }

    pub fn finalize(&mut self, block: &BlockHeader) {
        if self.position == block.parent_hash {
            self.position = block.hash;
            self.dirty = None;
        } else {
            self.reset(block.hash);
        }
    }

    pub fn position(&self) -> B256 {
        self.position
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn matches(&self, header: &BlockHeader) -> bool {
        match &self.dirty {
            Some(dirty) => dirty == header,
            None => self.position == header.parent_hash,
        }
    }

    fn reset(&mut self, position: B256) {
        trace!(old = %self.position, new = %position, "resetting nonce cache");
        self.cache.clear();
        self.position = position;
        self.dirty = None;
    }
}

#[cfg(test)]
mod tests {
    use super::NonceCache;
    use alloy_primitives::Address;
    use app_core::chain::{
        BlockBuilder, BuildRequest, ChainView, DevChain, dev_transaction,
    };
    use app_core::message::assemble_user_transactions;

    fn build_one(chain: &DevChain, sender: Address, nonce: u64) -> app_core::block::BlockHeader {
        let head = chain.head().expect("head");
        let message = assemble_user_transactions(
            &[dev_transaction(sender, nonce, b"payload")],
            &head,
            0,
        );
        chain
            .build_block(
                &head,
                &BuildRequest {
                    number: head.number + 1,
                    message,
                },
            )
            .expect("build block")
            .header
    }

    #[test]
    fn reads_through_state_and_then_hits() {
        let chain = DevChain::default();
        let sender = Address::repeat_byte(1);
        chain.set_account_nonce(sender, 5);
        let pending = chain.head().expect("head").pending_child();

        let mut cache = NonceCache::new(16);
        assert_eq!(cache.get(&pending, &chain, sender).expect("get"), 5);

        chain.set_account_nonce(sender, 9);
        assert_eq!(cache.get(&pending, &chain, sender).expect("cached"), 5);
    }

    #[test]
    fn finalize_extends_linear_chain_and_keeps_entries() {
        let chain = DevChain::default();
        let sender = Address::repeat_byte(1);
        let genesis = chain.head().expect("head");
        let pending = genesis.pending_child();

        let mut cache = NonceCache::new(16);
        cache.begin_new_block();
        assert_eq!(cache.get(&pending, &chain, sender).expect("get"), 0);
        cache.update(&pending, sender, 1);

        let block = build_one(&chain, sender, 0);
        cache.finalize(&block);
        assert_eq!(cache.position(), block.hash);
        assert_eq!(cache.len(), 1);

        let next = block.pending_child();
        assert_eq!(cache.get(&next, &chain, sender).expect("get"), 1);
    }

    #[test]
    fn mismatched_parent_invalidates_before_reading() {
        let chain = DevChain::default();
        let sender = Address::repeat_byte(1);
        let mut cache = NonceCache::new(16);

        let block = build_one(&chain, sender, 0);
        cache.finalize(&block);
        cache.update(&block.pending_child(), sender, 42);

        // A header that does not descend from the finalized block.
        let fork = build_one(&chain, sender, 1).pending_child();
        assert_ne!(fork.parent_hash, block.hash);

        assert_eq!(cache.get(&fork, &chain, sender).expect("get"), 2);
        assert_eq!(cache.position(), fork.parent_hash);
    }

    #[test]
    fn finalize_on_unrelated_block_resets() {
        let chain = DevChain::default();
        let sender = Address::repeat_byte(3);
        let mut cache = NonceCache::new(16);
        let pending = chain.head().expect("head").pending_child();
        cache.update(&pending, sender, 7);

        let first = build_one(&chain, sender, 0);
        let second = build_one(&chain, sender, 1);
        cache.finalize(&second);
        assert_eq!(cache.position(), second.hash);
        assert!(cache.is_empty());
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn unknown_parent_surfaces_chain_error() {
        let chain = DevChain::default();
        let mut cache = NonceCache::new(4);
        let mut orphan = chain.head().expect("head").pending_child();
        orphan.parent_hash = alloy_primitives::B256::repeat_byte(0xde);
        assert!(cache.get(&orphan, &chain, Address::ZERO).is_err());
    }
}
