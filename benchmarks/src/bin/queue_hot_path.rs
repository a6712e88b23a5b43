// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use benchmarks::{BenchResult, CycleBenchConfig, print_stats, run_cycle_bench};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "queue_hot_path",
    about = "in-process benchmark for enqueue + start/append/end sequencing cycles",
    version,
    after_help = "Examples:\n  cargo run -p benchmarks --bin queue_hot_path -- --count 10000 --senders 64\n  cargo run -p benchmarks --bin queue_hot_path --release -- --count 50000 --json"
)]
struct Args {
    #[arg(long, default_value_t = 10_000_u64)]
    count: u64,
    #[arg(long, default_value_t = 64_u64)]
    senders: u64,
    #[arg(long, default_value_t = 128_usize)]
    max_txs_per_block: usize,
    #[arg(long, default_value_t = 128_usize)]
    payload_bytes: usize,
    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> BenchResult<()> {
    let args = Args::parse();
    let config = CycleBenchConfig {
        count: args.count,
        senders: args.senders,
        max_txs_per_block: args.max_txs_per_block,
        payload_bytes: args.payload_bytes,
    };
    if !args.json {
        println!(
            "cycle config: count={}, senders={}, max_txs_per_block={}, payload_bytes={}",
            config.count, config.senders, config.max_txs_per_block, config.payload_bytes
        );
    }

    let report = run_cycle_bench(config).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "cycle benchmark completed: count={}, blocks={}",
        config.count, report.blocks
    );
    println!("tx_per_s: {:.2}", report.tx_per_s);
    print_stats("enqueue", &report.enqueue);
    print_stats("sequencing_cycle (start+append+end)", &report.cycle);
    print_stats("resolve_wait", &report.resolve);
    Ok(())
}
