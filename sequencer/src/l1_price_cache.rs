// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L1PriceDataOfMsg {
    pub call_data_units: u64,
    pub cumulative_call_data_units: u64,
    pub l1_gas_charged: u64,
    pub cumulative_l1_gas_charged: u64,
}

/// Per-message L1 pricing data for a contiguous range `[start, end]` of message indices.
#[derive(Debug, Default)]
pub struct L1PriceCache {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    start: u64,
    end: u64,
    entries: VecDeque<L1PriceDataOfMsg>,
}

impl Inner {
    fn reset_to(&mut self, msg_idx: u64, call_data_units: u64, l1_gas_charged: u64) {
        self.start = msg_idx;
        self.end = msg_idx;
        self.entries.clear();
        self.entries.push_back(L1PriceDataOfMsg {
            call_data_units,
            cumulative_call_data_units: call_data_units,
            l1_gas_charged,
            cumulative_l1_gas_charged: l1_gas_charged,
        });
    }
}

impl L1PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_l1_price_data_of_msg(&self, msg_idx: u64, call_data_units: u64, l1_gas_charged: u64) {
        let mut inner = self.lock();
        let size = inner.entries.len() as u64;
        if size == 0 || inner.start == 0 || inner.end == 0 || size != inner.end - inner.start + 1 {
            inner.reset_to(msg_idx, call_data_units, l1_gas_charged);
            return;
        }

        if msg_idx == inner.end + 1 {
            let last = inner.entries.back().copied().unwrap_or_default();
            inner.entries.push_back(L1PriceDataOfMsg {
                call_data_units,
                cumulative_call_data_units: last
                    .cumulative_call_data_units
                    .saturating_add(call_data_units),
                l1_gas_charged,
                cumulative_l1_gas_charged: last
                    .cumulative_l1_gas_charged
                    .saturating_add(l1_gas_charged),
            });
            inner.end = msg_idx;
        } else if msg_idx > inner.end + 1 {
            trace!(msg_idx, end = inner.end, "gap in l1 price data, resetting");
            inner.reset_to(msg_idx, call_data_units, l1_gas_charged);
        } else if msg_idx < inner.start {
            trace!(msg_idx, start = inner.start, "l1 price data before cache start, ignoring");
        } else {
            trace!(msg_idx, "l1 price data already cached, ignoring");
        }
    }

    /// Drops everything up to and including `to`.
    pub fn mark_feed_start(&self, to: u64) {
        let mut inner = self.lock();
        if to < inner.start {
            trace!(to, start = inner.start, "feed start below cached range");
        } else if to >= inner.end {
            inner.start = 0;
            inner.end = 0;
            inner.entries.clear();
        } else {
            let drop_count = (to - inner.start + 1) as usize;
            let len = inner.entries.len();
            inner.entries.drain(..drop_count.min(len));
            inner.start = to + 1;
        }
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        let inner = self.lock();
        (!inner.entries.is_empty()).then_some((inner.start, inner.end))
    }

    pub fn get(&self, msg_idx: u64) -> Option<L1PriceDataOfMsg> {
        let inner = self.lock();
        if inner.entries.is_empty() || msg_idx < inner.start || msg_idx > inner.end {
            return None;
        }
        inner.entries.get((msg_idx - inner.start) as usize).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("l1 price cache mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::L1PriceCache;

    #[test]
    fn contiguous_messages_accumulate() {
        let cache = L1PriceCache::new();
        cache.cache_l1_price_data_of_msg(1, 10, 100);
        cache.cache_l1_price_data_of_msg(2, 5, 50);
        cache.cache_l1_price_data_of_msg(3, 1, 10);

        assert_eq!(cache.range(), Some((1, 3)));
        let third = cache.get(3).expect("entry 3");
        assert_eq!(third.call_data_units, 1);
        assert_eq!(third.cumulative_call_data_units, 16);
        assert_eq!(third.cumulative_l1_gas_charged, 160);
    }

    #[test]
    fn gap_resets_and_repeats_are_ignored() {
        let cache = L1PriceCache::new();
        cache.cache_l1_price_data_of_msg(1, 10, 100);
        cache.cache_l1_price_data_of_msg(2, 10, 100);
        cache.cache_l1_price_data_of_msg(2, 99, 999);
        assert_eq!(cache.get(2).expect("entry 2").call_data_units, 10);

        cache.cache_l1_price_data_of_msg(7, 3, 30);
        assert_eq!(cache.range(), Some((7, 7)));
        assert_eq!(cache.get(7).expect("entry 7").cumulative_call_data_units, 3);
    }

    #[test]
    fn mark_feed_start_trims_front() {
        let cache = L1PriceCache::new();
        for idx in 1..=5 {
            cache.cache_l1_price_data_of_msg(idx, idx, idx * 10);
        }
        cache.mark_feed_start(2);
        assert_eq!(cache.range(), Some((3, 5)));
        assert_eq!(cache.get(3).expect("entry 3").cumulative_call_data_units, 6);

        cache.mark_feed_start(1);
        assert_eq!(cache.range(), Some((3, 5)));

        cache.mark_feed_start(5);
        assert_eq!(cache.range(), None);
    }
}
