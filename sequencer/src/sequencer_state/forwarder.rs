// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::Duration;

use app_core::l2_tx::L2Transaction;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

const NO_SEQUENCER_MESSAGES: [&str; 3] = [
    "sequencer temporarily not available",
    "sequencer not available",
    "no sequencer",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("sequencer temporarily not available")]
    Disabled,
    #[error("no sequencer: {0}")]
    NoSequencer(String),
    #[error("forward cancelled")]
    Cancelled,
    #[error("invalid forward target {url}: {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("forward failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("forward rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid forward response: {0}")]
    InvalidResponse(String),
    #[error("forward transport error")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
}

impl ForwardError {
    /// Errors meaning "nobody is sequencing right now"; the transaction should be kept.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Disabled | Self::NoSequencer(_))
    }
}

/// Classifies an error message coming back from the peer.
pub fn is_no_sequencer_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    NO_SEQUENCER_MESSAGES
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

/// Relays raw transactions to the active sequencer over JSON-RPC.
#[derive(Debug)]
pub struct TransactionForwarder {
    primary_target: String,
    url: reqwest::Url,
    client: reqwest::Client,
    disabled: CancellationToken,
}

impl TransactionForwarder {
    pub fn new(target: &str, timeout: Duration) -> Result<Self, ForwardError> {
        let url = reqwest::Url::parse(target).map_err(|err| ForwardError::InvalidTarget {
            url: target.to_string(),
            reason: err.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ForwardError::Transport { source })?;

        Ok(Self {
            primary_target: target.to_string(),
            url,
            client,
            disabled: CancellationToken::new(),
        })
    }

    pub fn primary_target(&self) -> &str {
        &self.primary_target
    }

    /// Fails later forwards fast and aborts the ones in flight.
    pub fn disable(&self) {
        self.disabled.cancel();
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.is_cancelled()
    }

    pub async fn forward_transaction(
        &self,
        tx: &L2Transaction,
        cancel: &CancellationToken,
    ) -> Result<(), ForwardError> {
        if self.is_disabled() {
            return Err(ForwardError::Disabled);
        }

        let result = tokio::select! {
            biased;
            _ = self.disabled.cancelled() => Err(ForwardError::Disabled),
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            result = self.send_raw_transaction(tx) => result,
        };

        match &result {
            Ok(()) => debug!(tx_hash = %tx.hash(), target = %self.primary_target, "forwarded transaction"),
            Err(err) if err.is_retryable() => {
                debug!(tx_hash = %tx.hash(), error = %err, "forward target not sequencing")
            }
            Err(err) => {
                warn!(tx_hash = %tx.hash(), target = %self.primary_target, error = %err, "error forwarding transaction")
            }
        }
        result
    }

    async fn send_raw_transaction(&self, tx: &L2Transaction) -> Result<(), ForwardError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendRawTransaction",
            "params": [tx.raw_hex()],
        });

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|source| ForwardError::Transport { source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ForwardError::Transport { source })?;
        if !status.is_success() {
            return Err(ForwardError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RpcResponse = serde_json::from_str(&body)
            .map_err(|err| ForwardError::InvalidResponse(err.to_string()))?;
        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_else(|| "unknown error".to_string());
            if is_no_sequencer_message(&message) {
                return Err(ForwardError::NoSequencer(message));
            }
            return Err(ForwardError::Rpc {
                code: error.code,
                message,
            });
        }
        if parsed.result.is_none() {
            return Err(ForwardError::InvalidResponse(
                "response has neither result nor error".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for TransactionForwarder {
    fn drop(&mut self) {
        self.disable();
    }
}
