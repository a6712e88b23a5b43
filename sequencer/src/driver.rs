// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Self-driving sequencing loop for nodes without an external consensus client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use app_core::chain::ExecutionChain;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordinator::{SequencingCoordinator, SequencingError};

#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Pause after a failed cycle before trying again.
    pub error_backoff: Duration,
    /// Consecutive failed cycles tolerated before the driver gives up.
    pub max_consecutive_errors: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_millis(100),
            max_consecutive_errors: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("sequencing driver shutdown requested")]
    ShutdownRequested,
    #[error("sequencing driver gave up after {count} consecutive failures")]
    TooManyFailures {
        count: u32,
        #[source]
        last: SequencingError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DriverStop {
    shutdown: Arc<AtomicBool>,
}

impl DriverStop {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Calls start, append and end in a loop, sleeping for whatever wait each start reports.
pub struct SequencingDriver<C: ExecutionChain + 'static> {
    coordinator: Arc<SequencingCoordinator<C>>,
    stop: DriverStop,
    config: DriverConfig,
}

impl<C: ExecutionChain + 'static> SequencingDriver<C> {
    pub fn new(coordinator: Arc<SequencingCoordinator<C>>, config: DriverConfig) -> Self {
        Self {
            coordinator,
            stop: DriverStop::default(),
            config,
        }
    }

    pub fn spawn(self) -> (JoinHandle<DriverError>, DriverStop) {
        let stop = self.stop.clone();
        let handle = tokio::spawn(async move { self.run().await });
        (handle, stop)
    }

    async fn run(self) -> DriverError {
        let mut consecutive_errors = 0_u32;
        while !self.stop.is_shutdown_requested() {
            match self.coordinator.start_sequencing().await {
                Ok(result) => {
                    consecutive_errors = 0;
                    if let Some(msg) = &result.sequenced_msg {
                        debug!(msg_idx = msg.msg_idx, "driver sequenced message");
                        self.coordinator.append_last_sequenced_block();
                        self.coordinator.end_sequencing(None);
                    }
                    let wait = result.wait_duration();
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(SequencingError::MutexHeld) => {
                    // Someone else drives this cycle.
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(error = %err, consecutive_errors, "sequencing cycle failed");
                    self.coordinator.end_sequencing(Some(err.to_string()));
                    if consecutive_errors >= self.config.max_consecutive_errors.max(1) {
                        return DriverError::TooManyFailures {
                            count: consecutive_errors,
                            last: err,
                        };
                    }
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
        DriverError::ShutdownRequested
    }
}
