// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::coordinator::SequencingError;
use crate::tx_queue::TxError;

#[derive(Debug, Error, Clone)]
pub enum ApiError {
    #[error("{0}")]
    ParseError(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("the method {0} does not exist/is not available")]
    MethodNotFound(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    InternalError(String),
    #[error("{0}")]
    Server(String),
}

#[derive(Debug, Serialize)]
pub(super) struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
pub(super) struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub(super) fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub(super) fn failure(id: Value, error: &ApiError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcErrorObject {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }
}

impl ApiError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::ParseError(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Only unparseable bodies leave the JSON-RPC envelope; everything else is HTTP 200.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ParseError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::OK,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError(_) => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
            Self::Server(_) => -32000,
        }
    }
}

impl From<TxError> for ApiError {
    fn from(value: TxError) -> Self {
        Self::Server(value.to_string())
    }
}

impl From<SequencingError> for ApiError {
    fn from(value: SequencingError) -> Self {
        Self::Server(value.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = RpcResponse::failure(Value::Null, &self);
        (self.status(), Json(body)).into_response()
    }
}
