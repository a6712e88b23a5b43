// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use app_core::chain::{DevChain, dev_transaction};
use app_core::l2_tx::L2Transaction;
use serde::Serialize;
use sequencer::coordinator::{CoordinatorConfig, SequencingCoordinator};
use sequencer::sequencer_state::SequencerState;
use sequencer::tx_queue::{TransactionQueue, TransactionQueueConfig, TxHandle};

pub type BenchResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub p999: Duration,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleBenchConfig {
    pub count: u64,
    pub senders: u64,
    pub max_txs_per_block: usize,
    pub payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleBenchReport {
    pub config: CycleBenchConfig,
    pub blocks: u64,
    pub total_wall: Duration,
    pub tx_per_s: f64,
    pub enqueue: Stats,
    pub cycle: Stats,
    pub resolve: Stats,
}

/// Enqueues `count` transactions, then runs start → append → end until the queue is empty.
pub async fn run_cycle_bench(config: CycleBenchConfig) -> BenchResult<CycleBenchReport> {
    if config.count == 0 {
        return Err(err("count must be positive"));
    }
    let queue = Arc::new(TransactionQueue::new(TransactionQueueConfig {
        max_queue_size: usize::try_from(config.count)?.max(1),
        queue_timeout: Duration::from_secs(60),
        max_tx_data_size: 0,
    }));
    let coordinator = SequencingCoordinator::new(
        Arc::new(DevChain::default()),
        Arc::clone(&queue),
        SequencerState::default(),
        CoordinatorConfig {
            max_txs_per_block: config.max_txs_per_block.max(1),
            ..CoordinatorConfig::default()
        },
    );
    coordinator.activate();

    let txs = make_transactions(config.count, config.senders, config.payload_bytes);
    let started = now();

    let mut enqueue_samples = Vec::with_capacity(txs.len());
    let mut handles: Vec<(L2Transaction, TxHandle)> = Vec::with_capacity(txs.len());
    for tx in txs {
        let enqueue_started = now();
        let handle = queue.enqueue_transaction(tx.clone())?;
        enqueue_samples.push(enqueue_started.elapsed());
        handles.push((tx, handle));
    }

    let mut cycle_samples = Vec::new();
    let mut blocks = 0_u64;
    while queue.queue_len() + queue.retry_len() > 0 {
        let cycle_started = now();
        let result = coordinator.start_sequencing().await?;
        if result.sequenced_msg.is_none() {
            return Err(err("sequencer produced no block while transactions were queued"));
        }
        coordinator.append_last_sequenced_block();
        coordinator.end_sequencing(None);
        cycle_samples.push(cycle_started.elapsed());
        blocks += 1;
    }

    let mut resolve_samples = Vec::with_capacity(handles.len());
    for (tx, handle) in handles {
        let resolve_started = now();
        let hash = handle.wait().await?;
        if hash != tx.hash() {
            return Err(err(format!("hash mismatch for {}", tx.hash())));
        }
        resolve_samples.push(resolve_started.elapsed());
    }
    let total_wall = started.elapsed();

    Ok(CycleBenchReport {
        config,
        blocks,
        total_wall,
        tx_per_s: throughput_tx_per_s(usize::try_from(config.count)?, total_wall),
        enqueue: summarize(&enqueue_samples)?,
        cycle: summarize(&cycle_samples)?,
        resolve: summarize(&resolve_samples)?,
    })
}

/// Round-robins senders so every sender's nonces stay contiguous.
pub fn make_transactions(count: u64, senders: u64, payload_bytes: usize) -> Vec<L2Transaction> {
    let senders = senders.max(1);
    let payload = vec![0x5a_u8; payload_bytes];
    (0..count)
        .map(|i| {
            let sender_index = i % senders;
            let mut sender = [0_u8; 20];
            sender[12..].copy_from_slice(&(sender_index + 1).to_be_bytes());
            dev_transaction(Address::from(sender), i / senders, &payload)
        })
        .collect()
}

pub fn summarize(samples: &[Duration]) -> BenchResult<Stats> {
    if samples.is_empty() {
        return Err(err("cannot summarize empty sample set"));
    }

    let mut nanos: Vec<u128> = samples.iter().map(Duration::as_nanos).collect();
    nanos.sort_unstable();
    let sum: u128 = nanos.iter().copied().sum();
    let count = nanos.len();

    Ok(Stats {
        count,
        min: duration_from_nanos(nanos[0]),
        max: duration_from_nanos(nanos[count - 1]),
        mean: duration_from_nanos(sum / count as u128),
        p50: duration_from_nanos(percentile(&nanos, 0.50)),
        p95: duration_from_nanos(percentile(&nanos, 0.95)),
        p99: duration_from_nanos(percentile(&nanos, 0.99)),
        p999: duration_from_nanos(percentile(&nanos, 0.999)),
    })
}

pub fn print_stats(name: &str, stats: &Stats) {
    println!("{name}:");
    println!("  count: {}", stats.count);
    println!("  min:   {}", format_ms(stats.min));
    println!("  p50:   {}", format_ms(stats.p50));
    println!("  p95:   {}", format_ms(stats.p95));
    println!("  p99:   {}", format_ms(stats.p99));
    println!("  p99.9: {}", format_ms(stats.p999));
    println!("  max:   {}", format_ms(stats.max));
    println!("  mean:  {}", format_ms(stats.mean));
}

pub fn throughput_tx_per_s(accepted_count: usize, total_wall: Duration) -> f64 {
    if total_wall.is_zero() {
        0.0
    } else {
        accepted_count as f64 / total_wall.as_secs_f64()
    }
}

pub fn now() -> Instant {
    Instant::now()
}

fn percentile(sorted_nanos: &[u128], p: f64) -> u128 {
    let last = sorted_nanos.len() - 1;
    let rank = (p * last as f64).ceil() as usize;
    sorted_nanos[rank.min(last)]
}

fn duration_from_nanos(value: u128) -> Duration {
    let nanos = u64::try_from(value).unwrap_or(u64::MAX);
    Duration::from_nanos(nanos)
}

fn format_ms(value: Duration) -> String {
    format!("{:.3} ms", value.as_secs_f64() * 1000.0)
}

fn err(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(std::io::Error::other(message.into()))
}
