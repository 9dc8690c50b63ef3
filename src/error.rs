// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherError {
    // Transient transport failure talking to a JSON-RPC endpoint
    TransientRpcError(String),
    // Non-transient RPC failure (HTTP error status, malformed envelope)
    RpcError(String),
    // The RPC answered but the payload did not deserialize into the expected shape
    InvalidResponse(String),
    // A rescan window was rejected before any fetch happened
    InvalidRescanWindow { begin_height: i64, end_height: i64 },
    // Uncategorized error
    Generic(String),
}

impl WatcherError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            WatcherError::TransientRpcError(_) => "transient_rpc_error",
            WatcherError::RpcError(_) => "rpc_error",
            WatcherError::InvalidResponse(_) => "invalid_response",
            WatcherError::InvalidRescanWindow { .. } => "invalid_rescan_window",
            WatcherError::Generic(_) => "generic",
        }
    }
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::TransientRpcError(msg) => write!(f, "transient rpc error: {}", msg),
            WatcherError::RpcError(msg) => write!(f, "rpc error: {}", msg),
            WatcherError::InvalidResponse(msg) => write!(f, "invalid rpc response: {}", msg),
            WatcherError::InvalidRescanWindow {
                begin_height,
                end_height,
            } => write!(
                f,
                "invalid rescan window: begin {} end {}",
                begin_height, end_height
            ),
            WatcherError::Generic(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for WatcherError {}

pub type WatcherResult<T> = Result<T, WatcherError>;
