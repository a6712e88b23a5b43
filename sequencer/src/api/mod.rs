// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! JSON-RPC surface: the consensus-facing `sequencer_*` methods plus `eth_sendRawTransaction`.

mod error;

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use app_core::chain::ExecutionChain;
use app_core::message::{L1IncomingMessage, MessageWithMetadata};

use crate::coordinator::SequencingCoordinator;

pub use error::ApiError;

use error::RpcResponse;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayedMessagesParams {
    messages: Vec<L1IncomingMessage>,
    first_msg_idx: u64,
}

pub fn router<C: ExecutionChain + 'static>(
    coordinator: Arc<SequencingCoordinator<C>>,
    max_body_bytes: usize,
) -> Router {
    Router::new()
        .route("/", post(handle_rpc::<C>))
        .with_state(coordinator)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn handle_rpc<C: ExecutionChain + 'static>(
    State(coordinator): State<Arc<SequencingCoordinator<C>>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(err) => return ApiError::parse_error(format!("parse error: {err}")).into_response(),
    };
    if body.is_array() {
        let err = ApiError::invalid_request("batch requests are not supported");
        return Json(RpcResponse::failure(Value::Null, &err)).into_response();
    }

    let request: RpcRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            let err = ApiError::invalid_request(format!("invalid request: {err}"));
            return Json(RpcResponse::failure(Value::Null, &err)).into_response();
        }
    };

    debug!(method = %request.method, "rpc call");
    let response = match dispatch(&coordinator, &request.method, request.params).await {
        Ok(result) => RpcResponse::success(request.id, result),
        Err(err) => {
            debug!(method = %request.method, error = %err, "rpc call failed");
            RpcResponse::failure(request.id, &err)
        }
    };
    Json(response).into_response()
}

async fn dispatch<C: ExecutionChain>(
    coordinator: &SequencingCoordinator<C>,
    method: &str,
    params: Value,
) -> Result<Value, ApiError> {
    match method {
        "sequencer_startSequencing" => {
            let result = coordinator.start_sequencing().await?;
            to_value(&result)
        }
        "sequencer_endSequencing" => {
            let error: Option<String> = optional_param(&params, 0)?;
            coordinator.end_sequencing(error.filter(|error| !error.is_empty()));
            Ok(ok())
        }
        "sequencer_enqueueDelayedMessages" => {
            let DelayedMessagesParams {
                messages,
                first_msg_idx,
            } = required_param(&params, 0)?;
            coordinator.enqueue_delayed_messages(messages, first_msg_idx);
            Ok(ok())
        }
        "sequencer_appendLastSequencedBlock" => {
            coordinator.append_last_sequenced_block();
            Ok(ok())
        }
        "sequencer_nextDelayedMessageNumber" => {
            Ok(json!(coordinator.next_delayed_message_number()?))
        }
        "sequencer_pause" => {
            coordinator.pause();
            Ok(ok())
        }
        "sequencer_activate" => {
            coordinator.activate();
            Ok(ok())
        }
        "sequencer_forwardTo" => {
            let url: String = required_param(&params, 0)?;
            coordinator.forward_to(&url)?;
            Ok(ok())
        }
        "sequencer_resequenceReorgedMessage" => {
            let msg: Option<MessageWithMetadata> = optional_param(&params, 0)?;
            let Some(msg) = msg else {
                return Ok(Value::Null);
            };
            let sequenced = coordinator.resequence_reorged_message(msg).await?;
            to_value(&sequenced)
        }
        "sequencer_markFeedStart" => {
            let to: u64 = required_param(&params, 0)?;
            coordinator.mark_feed_start(to);
            Ok(ok())
        }
        "eth_sendRawTransaction" => {
            let raw: String = required_param(&params, 0)?;
            let raw = decode_hex_0x(&raw).map_err(ApiError::invalid_params)?;

            // Dropping the request (client went away) cancels the queued entry.
            let cancel = CancellationToken::new();
            let _guard = cancel.clone().drop_guard();
            let hash = coordinator.send_raw_transaction(&raw, &cancel).await?;
            info!(tx_hash = %hash, "transaction sequenced");
            Ok(json!(hash))
        }
        other => Err(ApiError::MethodNotFound(other.to_string())),
    }
}

fn ok() -> Value {
    Value::String("OK".to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value)
        .map_err(|err| ApiError::internal_error(format!("cannot encode result: {err}")))
}

fn positional(params: &Value, index: usize) -> Result<Option<&Value>, ApiError> {
    match params {
        Value::Null => Ok(None),
        Value::Array(items) => Ok(items.get(index).filter(|value| !value.is_null())),
        _ => Err(ApiError::invalid_params("params must be an array")),
    }
}

fn optional_param<T: DeserializeOwned>(params: &Value, index: usize) -> Result<Option<T>, ApiError> {
    positional(params, index)?
        .map(|value| {
            serde_json::from_value(value.clone()).map_err(|err| {
                ApiError::invalid_params(format!("invalid argument {index}: {err}"))
            })
        })
        .transpose()
}

fn required_param<T: DeserializeOwned>(params: &Value, index: usize) -> Result<T, ApiError> {
    optional_param(params, index)?
        .ok_or_else(|| ApiError::invalid_params(format!("missing value for required argument {index}")))
}

fn decode_hex_0x(value: &str) -> Result<Vec<u8>, String> {
    if !value.starts_with("0x") {
        return Err("hex string must start with 0x".to_string());
    }
    alloy_primitives::hex::decode(value).map_err(|err| format!("invalid hex: {err}"))
}
