// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Start / append / end sequencing protocol.
//!
//! Each cycle produces at most one block. Delayed messages always win over user
//! transactions; user transactions are nonce-checked against the [`NonceCache`] before
//! they are handed to the block builder. Handles of included transactions are resolved
//! only when the cycle ends.

mod error;
mod types;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, B256};
use app_core::block::{BlockHeader, BuiltBlock, SequencedMsg};
use app_core::chain::{BuildRequest, ExecutionChain};
use app_core::l2_tx::L2Transaction;
use app_core::message::{L1IncomingMessage, MessageWithMetadata, assemble_user_transactions};
use futures_util::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delayed_queue::DelayedMessageQueue;
use crate::l1_price_cache::L1PriceCache;
use crate::nonce_cache::NonceCache;
use crate::sequencer_state::{ForwardError, SequencerMode, SequencerState, TransactionForwarder};
use crate::tx_queue::{QueuedTransaction, TransactionQueue, TxError};

pub use error::SequencingError;
pub use types::{
    CoordinatorConfig, Disposition, INACTIVE_WAIT, MAX_BLOCK_SPEED, StartSequencingResult,
};

use types::{IncludedBatch, SequencedBlockInfo};

pub struct SequencingCoordinator<C: ExecutionChain> {
    chain: Arc<C>,
    config: CoordinatorConfig,
    tx_queue: Arc<TransactionQueue>,
    delayed_queue: DelayedMessageQueue,
    state: SequencerState,
    nonce_cache: Mutex<NonceCache>,
    l1_prices: L1PriceCache,
    cycle: Arc<Semaphore>,
    held_cycle: Mutex<Option<OwnedSemaphorePermit>>,
    last_sequenced: Mutex<Option<SequencedBlockInfo>>,
    included: Mutex<Vec<IncludedBatch>>,
}

impl<C: ExecutionChain> SequencingCoordinator<C> {
    pub fn new(
        chain: Arc<C>,
        tx_queue: Arc<TransactionQueue>,
        state: SequencerState,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            chain,
            nonce_cache: Mutex::new(NonceCache::new(config.nonce_cache_size)),
            config,
            tx_queue,
            delayed_queue: DelayedMessageQueue::new(),
            state,
            l1_prices: L1PriceCache::new(),
            cycle: Arc::new(Semaphore::new(1)),
            held_cycle: Mutex::new(None),
            last_sequenced: Mutex::new(None),
            included: Mutex::new(Vec::new()),
        }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn tx_queue(&self) -> &Arc<TransactionQueue> {
        &self.tx_queue
    }

    pub fn delayed_queue(&self) -> &DelayedMessageQueue {
        &self.delayed_queue
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn l1_price_cache(&self) -> &L1PriceCache {
        &self.l1_prices
    }

    /// Runs one sequencing step. Fails with "mutex held" while another cycle is open.
    ///
    /// When a block is produced the cycle stays open until `end_sequencing` is called.
    pub async fn start_sequencing(&self) -> Result<StartSequencingResult, SequencingError> {
        let permit = Arc::clone(&self.cycle)
            .try_acquire_owned()
            .map_err(|_| SequencingError::MutexHeld)?;

        let snapshot = self.state.snapshot();
        if !snapshot.is_active() {
            if snapshot.mode == SequencerMode::Forwarding {
                if let Some(forwarder) = snapshot.forwarder {
                    self.forward_pending(&forwarder).await;
                }
            }
            return Ok(StartSequencingResult::idle(INACTIVE_WAIT));
        }

        if let Some(msg) = self.sequence_delayed_message()? {
            self.hold_cycle(permit);
            return Ok(StartSequencingResult::produced(msg));
        }

        if let Some(msg) = self.create_block_with_regular_txs()? {
            self.hold_cycle(permit);
            return Ok(StartSequencingResult::produced(msg));
        }

        Ok(StartSequencingResult::idle(MAX_BLOCK_SPEED))
    }

    /// Closes the cycle. Included transactions get their hash, or `error` if one is given.
    pub fn end_sequencing(&self, error: Option<String>) {
        let batches = std::mem::take(&mut *lock(&self.included, "included batches"));
        self.release_cycle();
        if batches.is_empty() {
            return;
        }

        match error {
            None => {
                let mut nonce_cache = lock(&self.nonce_cache, "nonce cache");
                for batch in &batches {
                    nonce_cache.finalize(&batch.block.header);
                }
                drop(nonce_cache);

                for batch in batches {
                    let block_number = batch.block.header.number;
                    let tx_count = batch.entries.len();
                    for entry in batch.entries {
                        let hash = entry.tx().hash();
                        self.settle(entry, Disposition::Completed(hash));
                    }
                    debug!(block_number, tx_count, "resolved included transactions");
                }
            }
            Some(error) => {
                warn!(%error, "sequencing cycle ended with error");
                for entry in batches.into_iter().flat_map(|batch| batch.entries) {
                    self.settle(entry, Disposition::Failed(TxError::sequencing(error.clone())));
                }
            }
        }
    }

    /// Records L1 pricing for the last produced block. The cycle stays open until
    /// `end_sequencing`.
    pub fn append_last_sequenced_block(&self) {
        let last = lock(&self.last_sequenced, "last sequenced block").take();
        match last {
            Some(info) => {
                let (units, charged) = if info.from_delayed {
                    (0, 0)
                } else {
                    (info.block.call_data_units, info.block.l1_gas_charged)
                };
                self.l1_prices
                    .cache_l1_price_data_of_msg(info.msg_idx, units, charged);
                debug!(
                    msg_idx = info.msg_idx,
                    block_number = info.block.header.number,
                    "appended last sequenced block"
                );
            }
            None => debug!("append requested without a sequenced block"),
        }
    }

    pub fn enqueue_delayed_messages(&self, messages: Vec<L1IncomingMessage>, first_index: u64) {
        let count = messages.len();
        self.delayed_queue.enqueue(messages, first_index);
        debug!(count, first_index, "enqueued delayed messages");
    }

    pub fn next_delayed_message_number(&self) -> Result<u64, SequencingError> {
        if let Some(tail) = self.delayed_queue.try_peek_tail() {
            return Ok(tail.message_index + 1);
        }
        Ok(self.chain.head()?.delayed_messages_read)
    }

    /// Rebuilds a message dropped by an L1 reorg on top of the current head.
    ///
    /// Delayed messages are only accepted when they are the next one the chain expects.
    pub async fn resequence_reorged_message(
        &self,
        msg: MessageWithMetadata,
    ) -> Result<Option<SequencedMsg>, SequencingError> {
        let _permit = Arc::clone(&self.cycle)
            .acquire_owned()
            .await
            .map_err(|_| SequencingError::MutexHeld)?;
        let head = self.chain.head()?;

        if let Some(delayed_index) = msg.message.delayed_index() {
            if delayed_index != head.delayed_messages_read {
                info!(
                    expected = head.delayed_messages_read,
                    found = delayed_index,
                    "not resequencing delayed message due to unexpected index"
                );
                return Ok(None);
            }
            return self
                .build_delayed(&head, msg.message, delayed_index)
                .map(Some);
        }

        let (msg_idx, block) = self.build_on(&head, &msg)?;
        info!(msg_idx, block_number = block.header.number, "resequenced regular message");
        Ok(Some(SequencedMsg::from_built(msg_idx, msg, &block)))
    }

    pub fn mark_feed_start(&self, to: u64) {
        self.l1_prices.mark_feed_start(to);
    }

    pub fn pause(&self) {
        self.state.pause();
    }

    pub fn activate(&self) {
        self.state.activate();
    }

    pub fn forward_to(&self, url: &str) -> Result<(), SequencingError> {
        self.state.forward_to(url).map_err(SequencingError::from)
    }

    /// Admits a raw transaction and waits for its outcome.
    pub async fn send_raw_transaction(
        &self,
        raw: &[u8],
        cancel: &CancellationToken,
    ) -> Result<B256, TxError> {
        if matches!(
            self.state.mode(),
            SequencerMode::Inactive | SequencerMode::Paused
        ) {
            return Err(TxError::NotAvailable);
        }
        let tx = self
            .chain
            .decode_transaction(raw)
            .map_err(|err| TxError::rejected(format!("invalid transaction: {err}")))?;
        self.tx_queue.enqueue_and_wait(tx, cancel).await
    }

    pub fn message_index(&self, block_number: u64) -> Result<u64, SequencingError> {
        block_number
            .checked_sub(self.config.genesis_block_num)
            .ok_or(SequencingError::BeforeGenesis {
                block_number,
                genesis_block_num: self.config.genesis_block_num,
            })
    }

    async fn forward_pending(&self, forwarder: &Arc<TransactionForwarder>) {
        let entries = self.take_live_entries();
        if entries.is_empty() {
            return;
        }

        let forwarder = forwarder.as_ref();
        let results = join_all(entries.into_iter().map(|entry| async move {
            let result = forwarder
                .forward_transaction(entry.tx(), entry.cancel_token())
                .await;
            (entry, result)
        }))
        .await;

        for (entry, result) in results {
            let disposition = match result {
                Ok(()) => Disposition::Completed(entry.tx().hash()),
                Err(err) if err.is_retryable() => Disposition::Retry(err.to_string()),
                Err(ForwardError::Cancelled) => Disposition::Failed(TxError::Cancelled),
                Err(err) => Disposition::Failed(TxError::forward(err.to_string())),
            };
            self.settle(entry, disposition);
        }
    }

    fn sequence_delayed_message(&self) -> Result<Option<SequencedMsg>, SequencingError> {
        let Some(delayed) = self.delayed_queue.try_dequeue() else {
            return Ok(None);
        };
        let head = self.chain.head()?;

        if delayed.message_index != head.delayed_messages_read {
            error!(
                got = delayed.message_index,
                expected = head.delayed_messages_read,
                "wrong delayed message sequenced, clearing delayed queue"
            );
            self.delayed_queue.clear();
            return Ok(None);
        }

        let index = delayed.message_index;
        self.build_delayed(&head, delayed.message, index)
            .map(Some)
            .inspect_err(|err| {
                error!(delayed_index = index, error = %err, "error sequencing delayed message");
                self.delayed_queue.clear();
            })
    }

    fn build_delayed(
        &self,
        head: &BlockHeader,
        message: L1IncomingMessage,
        delayed_index: u64,
    ) -> Result<SequencedMsg, SequencingError> {
        let msg_with_meta = MessageWithMetadata {
            message,
            delayed_messages_read: delayed_index + 1,
        };
        let (msg_idx, block) = self.build_on(head, &msg_with_meta)?;
        info!(
            msg_idx,
            delayed_index,
            block_number = block.header.number,
            "added delayed message"
        );

        let sequenced = SequencedMsg::from_built(msg_idx, msg_with_meta, &block);
        *lock(&self.last_sequenced, "last sequenced block") = Some(SequencedBlockInfo {
            msg_idx,
            block,
            from_delayed: true,
        });
        Ok(sequenced)
    }

    /// Drains up to one block's worth of entries, failing the cancelled and timed-out ones.
    fn take_live_entries(&self) -> Vec<QueuedTransaction> {
        let queue_timeout = self.tx_queue.config().queue_timeout;
        let mut entries = Vec::new();
        for entry in self.tx_queue.drain_batch(self.config.max_txs_per_block.max(1)) {
            if entry.is_cancelled() {
                self.settle(entry, Disposition::Failed(TxError::Cancelled));
            } else if entry.is_timed_out(queue_timeout) {
                self.settle(entry, Disposition::Failed(TxError::TimedOut));
            } else {
                entries.push(entry);
            }
        }
        entries
    }

    fn create_block_with_regular_txs(&self) -> Result<Option<SequencedMsg>, SequencingError> {
        let entries = self.take_live_entries();
        if entries.is_empty() {
            return Ok(None);
        }

        let head = match self.chain.head() {
            Ok(head) => head,
            Err(err) => {
                for entry in entries {
                    self.settle(entry, Disposition::Retry(err.to_string()));
                }
                return Err(err.into());
            }
        };

        let entries = self.precheck_nonces(&head.pending_child(), entries);
        if entries.is_empty() {
            return Ok(None);
        }

        let txs: Vec<L2Transaction> = entries.iter().map(|entry| entry.tx().clone()).collect();
        let msg_with_meta = assemble_user_transactions(&txs, &head, 0);

        let (msg_idx, block) = match self.build_on(&head, &msg_with_meta) {
            Ok(built) => built,
            Err(SequencingError::Build {
                block_number,
                source,
            }) => {
                error!(block_number, error = %source, "error creating block with user transactions");
                let transient = source.is_transient();
                for entry in entries {
                    let disposition = if transient {
                        Disposition::Retry(source.to_string())
                    } else {
                        Disposition::Failed(TxError::rejected(source.to_string()))
                    };
                    self.settle(entry, disposition);
                }
                return Ok(None);
            }
            Err(err) => {
                for entry in entries {
                    self.settle(entry, Disposition::Retry(err.to_string()));
                }
                return Err(err);
            }
        };

        info!(
            tx_count = entries.len(),
            msg_idx,
            block_number = block.header.number,
            "created block with user transactions"
        );

        let sequenced = SequencedMsg::from_built(msg_idx, msg_with_meta, &block);
        *lock(&self.last_sequenced, "last sequenced block") = Some(SequencedBlockInfo {
            msg_idx,
            block: block.clone(),
            from_delayed: false,
        });
        lock(&self.included, "included batches").push(IncludedBatch { block, entries });
        Ok(Some(sequenced))
    }

    /// Keeps transactions whose nonce is next in line for their sender.
    ///
    /// A transaction that is ahead of its sender's nonce waits for the rest of the batch:
    /// if its predecessor gets accepted it is accepted right after, otherwise it goes to
    /// the retry queue.
    fn precheck_nonces(
        &self,
        pending: &BlockHeader,
        entries: Vec<QueuedTransaction>,
    ) -> Vec<QueuedTransaction> {
        let mut nonce_cache = lock(&self.nonce_cache, "nonce cache");
        nonce_cache.begin_new_block();

        let mut accepted = Vec::with_capacity(entries.len());
        let mut pending_nonces: HashMap<Address, u64> = HashMap::new();
        let mut waiting: HashMap<(Address, u64), QueuedTransaction> = HashMap::new();
        let mut revived: VecDeque<QueuedTransaction> = VecDeque::new();
        let mut entries = entries.into_iter();

        while let Some(entry) = revived.pop_front().or_else(|| entries.next()) {
            let sender = entry.tx().sender();
            let tx_nonce = entry.tx().nonce();
            let state_nonce = match nonce_cache.get(pending, self.chain.as_ref(), sender) {
                Ok(nonce) => nonce,
                Err(err) => {
                    warn!(%sender, error = %err, "cannot read sender nonce");
                    self.settle(entry, Disposition::Retry(err.to_string()));
                    continue;
                }
            };
            let expected = pending_nonces.get(&sender).copied().unwrap_or(state_nonce);

            if tx_nonce == expected {
                pending_nonces.insert(sender, tx_nonce + 1);
                nonce_cache.update(pending, sender, tx_nonce + 1);
                if let Some(next) = waiting.remove(&(sender, tx_nonce + 1)) {
                    revived.push_back(next);
                }
                accepted.push(entry);
            } else if tx_nonce < state_nonce {
                self.settle(
                    entry,
                    Disposition::Failed(TxError::NonceTooLow {
                        sender,
                        tx_nonce,
                        state_nonce,
                    }),
                );
            } else if tx_nonce > expected {
                if let Some(duplicate) = waiting.insert((sender, tx_nonce), entry) {
                    self.settle(duplicate, Disposition::Retry("nonce too high".to_string()));
                }
            } else {
                // Same nonce as an earlier transaction in this batch; one of them fails
                // at execution.
                accepted.push(entry);
            }
        }
        drop(nonce_cache);

        for (_, entry) in waiting {
            self.settle(entry, Disposition::Retry("nonce too high".to_string()));
        }
        accepted
    }

    fn build_on(
        &self,
        head: &BlockHeader,
        message: &MessageWithMetadata,
    ) -> Result<(u64, BuiltBlock), SequencingError> {
        let block_number = head.number + 1;
        let msg_idx = self.message_index(block_number)?;
        let request = BuildRequest {
            number: block_number,
            message: message.clone(),
        };
        let block = self
            .chain
            .build_block(head, &request)
            .map_err(|source| SequencingError::Build {
                block_number,
                source,
            })?;
        Ok((msg_idx, block))
    }

    fn settle(&self, entry: QueuedTransaction, disposition: Disposition) {
        match disposition {
            Disposition::Completed(hash) => self.tx_queue.complete_transaction(entry, hash),
            Disposition::Failed(error) => self.tx_queue.fail_transaction(entry, error),
            Disposition::Retry(reason) => self.tx_queue.move_to_retry_queue(entry, &reason),
        }
    }

    fn hold_cycle(&self, permit: OwnedSemaphorePermit) {
        *lock(&self.held_cycle, "cycle permit") = Some(permit);
    }

    fn release_cycle(&self) {
        let permit = lock(&self.held_cycle, "cycle permit").take();
        drop(permit);
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> std::sync::MutexGuard<'a, T> {
    mutex
        .lock()
        .unwrap_or_else(|_| panic!("{what} mutex poisoned"))
}
