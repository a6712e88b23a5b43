// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Layer-2 transaction sequencer driven by an external consensus client.
//!
//! Flow: API -> transaction queue -> coordinator -> block builder.
//! The coordinator is the single writer that defines block order; delayed messages from
//! L1 always take priority over user transactions.
pub mod api;
pub mod coordinator;
pub mod delayed_queue;
pub mod driver;
pub mod l1_price_cache;
pub mod nonce_cache;
pub mod sequencer_state;
pub mod tx_queue;
