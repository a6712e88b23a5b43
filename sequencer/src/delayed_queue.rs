// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::VecDeque;
use std::sync::Mutex;

use app_core::message::{DelayedMessage, L1IncomingMessage};

/// FIFO of L1 delayed messages with externally assigned indices.
#[derive(Debug, Default)]
pub struct DelayedMessageQueue {
    inner: Mutex<VecDeque<DelayedMessage>>,
}

impl DelayedMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `messages`, assigning `first_index + i` in input order.
    pub fn enqueue(&self, messages: Vec<L1IncomingMessage>, first_index: u64) {
        let mut queue = self.lock();
        queue.extend(
            messages
                .into_iter()
                .zip(first_index..)
                .map(|(message, message_index)| DelayedMessage {
                    message_index,
                    message,
                }),
        );
    }

    pub fn try_dequeue(&self) -> Option<DelayedMessage> {
        self.lock().pop_front()
    }

    pub fn try_peek_tail(&self) -> Option<DelayedMessage> {
        self.lock().back().cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DelayedMessage>> {
        self.inner.lock().expect("delayed queue mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::DelayedMessageQueue;
    use alloy_primitives::{Address, U256};
    use app_core::message::{L1IncomingMessage, L1IncomingMessageHeader, L1MessageKind};
    use std::sync::Arc;

    fn message(timestamp: u64) -> L1IncomingMessage {
        L1IncomingMessage {
            header: L1IncomingMessageHeader {
                kind: L1MessageKind::EthDeposit,
                sender: Address::ZERO,
                block_number: 1,
                timestamp,
                request_id: None,
                base_fee_l1: U256::ZERO,
            },
            l2_msg: None,
            batch_gas_cost: None,
        }
    }

    #[test]
    fn dequeues_in_index_order_and_peeks_tail() {
        let queue = DelayedMessageQueue::new();
        queue.enqueue(vec![message(1), message(2), message(3)], 5);

        let tail = queue.try_peek_tail().expect("tail");
        assert_eq!(tail.message_index, 7);
        assert_eq!(tail.message.header.timestamp, 3);

        let drained: Vec<(u64, u64)> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|entry| (entry.message_index, entry.message.header.timestamp))
            .collect();
        assert_eq!(drained, vec![(5, 1), (6, 2), (7, 3)]);
        assert!(queue.try_dequeue().is_none());
        assert!(queue.try_peek_tail().is_none());
    }

    #[test]
    fn clear_discards_everything() {
        let queue = DelayedMessageQueue::new();
        queue.enqueue(vec![message(1), message(2)], 0);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.try_peek_tail().is_none());
    }

    #[test]
    fn concurrent_producers_keep_their_indices() {
        let queue = Arc::new(DelayedMessageQueue::new());
        let handles: Vec<_> = (0..4_u64)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    queue.enqueue(vec![message(producer), message(producer)], producer * 10);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer thread");
        }

        let mut indices: Vec<u64> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|entry| {
                assert_eq!(entry.message_index / 10, entry.message.header.timestamp);
                entry.message_index
            })
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 10, 11, 20, 21, 30, 31]);
    }
}
