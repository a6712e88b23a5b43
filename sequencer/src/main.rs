// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::sync::Arc;
use std::time::Duration;

use app_core::chain::{DevChain, DevChainConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sequencer::coordinator::{CoordinatorConfig, SequencingCoordinator};
use sequencer::driver::{DriverConfig, DriverError, SequencingDriver};
use sequencer::sequencer_state::{SequencerMode, SequencerState};
use sequencer::tx_queue::{TransactionQueue, TransactionQueueConfig, spawn_metrics_logger};

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8547";
const DEFAULT_MAX_QUEUE_SIZE: usize = 1024;
const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 12;
const DEFAULT_MAX_TX_DATA_SIZE: usize = 95_000;
const DEFAULT_MAX_TXS_PER_BLOCK: usize = 128;
const DEFAULT_NONCE_CACHE_SIZE: usize = 1024;
const DEFAULT_FORWARD_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_BODY_BYTES: usize = 128 * 1024;
const DEFAULT_GENESIS_BLOCK_NUM: u64 = 0;
const DEFAULT_INITIAL_MODE: &str = "inactive";
const DEFAULT_METRICS_LOG_INTERVAL_MS: u64 = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let chain = Arc::new(DevChain::new(DevChainConfig {
        genesis_block_num: config.coordinator.genesis_block_num,
        ..DevChainConfig::default()
    }));
    let tx_queue = Arc::new(TransactionQueue::new(config.queue));
    let state = SequencerState::new(config.forward_timeout);
    match config.initial_mode {
        SequencerMode::Active => state.activate(),
        SequencerMode::Paused => state.pause(),
        SequencerMode::Forwarding => {
            let url = config
                .forward_url
                .as_deref()
                .ok_or("SEQ_FORWARD_URL is required when SEQ_INITIAL_MODE=forwarding")?;
            state.forward_to(url)?;
        }
        SequencerMode::Inactive => {}
    }
    tracing::info!(mode = %state.mode(), "sequencer state initialised");

    let coordinator = Arc::new(SequencingCoordinator::new(
        chain,
        Arc::clone(&tx_queue),
        state,
        config.coordinator,
    ));

    let metrics_cancel = CancellationToken::new();
    let metrics_handle = config.metrics_log_interval.map(|interval| {
        spawn_metrics_logger(Arc::clone(&tx_queue), interval, metrics_cancel.clone())
    });

    let driver = config.self_drive.then(|| {
        SequencingDriver::new(Arc::clone(&coordinator), DriverConfig::default()).spawn()
    });

    let app = sequencer::api::router(Arc::clone(&coordinator), config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(address = %config.http_addr, self_drive = config.self_drive, "listening");

    let result: Result<(), Box<dyn std::error::Error>> = match driver {
        Some((mut driver_handle, driver_stop)) => {
            tokio::select! {
                server_result = axum::serve(listener, app) => {
                    driver_stop.request_shutdown();
                    match driver_handle.await {
                        Ok(DriverError::ShutdownRequested) => server_result.map_err(Into::into),
                        Ok(err) => Err(format!("sequencing driver exited during shutdown: {err}").into()),
                        Err(join_err) => {
                            Err(format!("sequencing driver join error during shutdown: {join_err}").into())
                        }
                    }
                }
                driver_result = &mut driver_handle => {
                    match driver_result {
                        Ok(err) => Err(format!("sequencing driver exited: {err}").into()),
                        Err(join_err) => Err(format!("sequencing driver join error: {join_err}").into()),
                    }
                }
            }
        }
        None => axum::serve(listener, app).await.map_err(Into::into),
    };

    tx_queue.close();
    metrics_cancel.cancel();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    result
}

struct Config {
    http_addr: String,
    queue: TransactionQueueConfig,
    coordinator: CoordinatorConfig,
    forward_timeout: Duration,
    max_body_bytes: usize,
    self_drive: bool,
    initial_mode: SequencerMode,
    forward_url: Option<String>,
    /// `None` when metrics logging is disabled.
    metrics_log_interval: Option<Duration>,
}

impl Config {
    fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let env = EnvReader { lookup };
        let initial_mode: SequencerMode = env
            .string("SEQ_INITIAL_MODE", DEFAULT_INITIAL_MODE)
            .parse()?;
        let metrics_enabled = env.bool("SEQ_METRICS_ENABLED", false);
        Ok(Self {
            http_addr: env.string("SEQ_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            queue: TransactionQueueConfig {
                max_queue_size: env.usize("SEQ_MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE).max(1),
                queue_timeout: Duration::from_secs(
                    env.u64("SEQ_QUEUE_TIMEOUT_SECS", DEFAULT_QUEUE_TIMEOUT_SECS).max(1),
                ),
                // 0 disables the size check.
                max_tx_data_size: env.usize("SEQ_MAX_TX_DATA_SIZE", DEFAULT_MAX_TX_DATA_SIZE),
            },
            coordinator: CoordinatorConfig {
                max_txs_per_block: env
                    .usize("SEQ_MAX_TXS_PER_BLOCK", DEFAULT_MAX_TXS_PER_BLOCK)
                    .max(1),
                nonce_cache_size: env
                    .usize("SEQ_NONCE_CACHE_SIZE", DEFAULT_NONCE_CACHE_SIZE)
                    .max(1),
                genesis_block_num: env.u64("SEQ_GENESIS_BLOCK_NUM", DEFAULT_GENESIS_BLOCK_NUM),
            },
            forward_timeout: Duration::from_millis(
                env.u64("SEQ_FORWARD_TIMEOUT_MS", DEFAULT_FORWARD_TIMEOUT_MS).max(1),
            ),
            max_body_bytes: env.usize("SEQ_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            self_drive: env.bool("SEQ_SELF_DRIVE", false),
            initial_mode,
            forward_url: (env.lookup)("SEQ_FORWARD_URL").filter(|url| !url.is_empty()),
            metrics_log_interval: metrics_enabled.then(|| {
                Duration::from_millis(
                    env.u64("SEQ_METRICS_LOG_INTERVAL_MS", DEFAULT_METRICS_LOG_INTERVAL_MS)
                        .max(1),
                )
            }),
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        (self.lookup)(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        (self.lookup)(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match (self.lookup)(key) {
            Some(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, DEFAULT_MAX_TX_DATA_SIZE};
    use sequencer::sequencer_state::SequencerMode;
    use std::collections::HashMap;
    use std::time::Duration;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned()).expect("parse config")
    }

    #[test]
    fn zero_max_tx_data_size_disables_the_limit() {
        let config = config_from(&[("SEQ_MAX_TX_DATA_SIZE", "0")]);
        assert_eq!(config.queue.max_tx_data_size, 0);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.queue.max_tx_data_size, DEFAULT_MAX_TX_DATA_SIZE);
        assert_eq!(config.initial_mode, SequencerMode::Inactive);
        assert!(config.metrics_log_interval.is_none());
        assert!(!config.self_drive);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("SEQ_INITIAL_MODE", "Forwarding"),
            ("SEQ_FORWARD_URL", "http://peer:8547"),
            ("SEQ_QUEUE_TIMEOUT_SECS", "3"),
            ("SEQ_SELF_DRIVE", "true"),
            ("SEQ_METRICS_ENABLED", "1"),
            ("SEQ_METRICS_LOG_INTERVAL_MS", "500"),
        ]);
        assert_eq!(config.initial_mode, SequencerMode::Forwarding);
        assert_eq!(config.forward_url.as_deref(), Some("http://peer:8547"));
        assert_eq!(config.queue.queue_timeout, Duration::from_secs(3));
        assert!(config.self_drive);
        assert_eq!(config.metrics_log_interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let result = Config::from_lookup(|key| {
            (key == "SEQ_INITIAL_MODE").then(|| "leader".to_string())
        });
        assert!(result.is_err());
    }
}
