// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

pub mod block;
pub mod chain;
pub mod l2_tx;
pub mod message;
