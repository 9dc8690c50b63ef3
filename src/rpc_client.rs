// Async JSON-RPC clients for the mainchain and sidechain endpoints, plus the
// retry-opaque facade the watcher consumes. Everything below the facade logs
// and retries; above it, only `None` signals absence.

use crate::error::{WatcherError, WatcherResult};
use crate::metrics::WatcherMetrics;
use crate::retry_with_max_elapsed_time;
use crate::types::{MainchainBlock, MainchainBlockInfo, VoteInfoRecord};
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// The interface contract of the out-of-scope RPC transport. The watcher
/// only ever talks to this seam; tests install a mock.
#[async_trait]
pub trait WatcherRpc: Send + Sync {
    /// Current mainchain tip height.
    async fn get_latest_height(&self) -> anyhow::Result<i64>;

    /// Full block with nominations, `None` when the height does not exist yet.
    async fn get_block_by_height(&self, height: i64) -> anyhow::Result<Option<MainchainBlock>>;

    /// Lighter variant sufficient for UTXO parsing.
    async fn get_block_info_by_height(
        &self,
        height: i64,
    ) -> anyhow::Result<Option<MainchainBlockInfo>>;

    /// Historical vote records from our own sidechain, `[start, end)` by
    /// epoch number; used by the fast-sync primer.
    async fn get_vote_info_by_epoch_number(
        &self,
        start: u64,
        end: u64,
    ) -> anyhow::Result<Vec<VoteInfoRecord>>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Clone, Debug)]
pub struct HttpRpcClient {
    http_client: reqwest::Client,
    rpc_url: String,
    username: String,
    password: String,
    request_id: Arc<AtomicU64>,
}

impl HttpRpcClient {
    pub fn new(
        rpc_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        fn shared_http_client() -> reqwest::Client {
            static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
            CLIENT
                .get_or_init(|| {
                    // Keep pooling enabled, tuned for many concurrent pollers.
                    reqwest::Client::builder()
                        .pool_max_idle_per_host(64)
                        .tcp_keepalive(Some(Duration::from_secs(30)))
                        .connect_timeout(Duration::from_secs(2))
                        .timeout(Duration::from_secs(30))
                        .build()
                        .expect("Failed to build reqwest client")
                })
                .clone()
        }

        Self {
            http_client: shared_http_client(),
            rpc_url: rpc_url.into(),
            username: username.into(),
            password: password.into(),
            request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> WatcherResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        };

        fn is_transient_transport_error(err: &reqwest::Error) -> bool {
            if err.is_connect() || err.is_timeout() {
                return true;
            }

            let msg = err.to_string().to_lowercase();
            msg.contains("connection closed")
                || msg.contains("connection reset")
                || msg.contains("broken pipe")
                || msg.contains("unexpected eof")
                || msg.contains("incomplete")
        }

        let max_attempts: usize = 3;
        let mut last_transport_err: Option<WatcherError> = None;

        for attempt in 0..max_attempts {
            let mut builder = self.http_client.post(&self.rpc_url).json(&request);
            if !self.username.is_empty() {
                builder = builder.basic_auth(&self.username, Some(&self.password));
            }
            let response = match builder.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt + 1 < max_attempts && is_transient_transport_error(&err) {
                        last_transport_err =
                            Some(WatcherError::TransientRpcError(err.to_string()));
                        warn!(
                            "[RPC] transport error calling {} (attempt {}/{}), retrying",
                            method,
                            attempt + 1,
                            max_attempts
                        );
                        tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                        continue;
                    }
                    return Err(WatcherError::RpcError(err.to_string()));
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                return Err(WatcherError::RpcError(format!(
                    "HTTP error: {} - {}",
                    status, error_text
                )));
            }

            let response_text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    if attempt + 1 < max_attempts && is_transient_transport_error(&err) {
                        last_transport_err =
                            Some(WatcherError::TransientRpcError(err.to_string()));
                        warn!(
                            "[RPC] failed reading response for {} (attempt {}/{}), retrying",
                            method,
                            attempt + 1,
                            max_attempts
                        );
                        tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                        continue;
                    }
                    return Err(WatcherError::RpcError(err.to_string()));
                }
            };

            let rpc_response: JsonRpcResponse = serde_json::from_str(&response_text)
                .map_err(|err| WatcherError::InvalidResponse(err.to_string()))?;

            if let Some(error) = rpc_response.error {
                return Err(WatcherError::RpcError(format!(
                    "RPC error {}: {}",
                    error.code, error.message
                )));
            }

            // The result may be null, which is valid for queries returning Option
            return Ok(rpc_response.result.unwrap_or(Value::Null));
        }

        Err(last_transport_err
            .unwrap_or_else(|| WatcherError::RpcError("RPC call failed after retries".into())))
    }
}

#[async_trait]
impl WatcherRpc for HttpRpcClient {
    async fn get_latest_height(&self) -> anyhow::Result<i64> {
        let result = self.call("getblockcount", vec![]).await?;
        result
            .as_i64()
            .ok_or_else(|| anyhow!("getblockcount returned non-integer: {}", result))
    }

    async fn get_block_by_height(&self, height: i64) -> anyhow::Result<Option<MainchainBlock>> {
        let result = self.call("getblockbyheight", vec![json!(height)]).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }

    async fn get_block_info_by_height(
        &self,
        height: i64,
    ) -> anyhow::Result<Option<MainchainBlockInfo>> {
        let result = self
            .call("getblockinfobyheight", vec![json!(height)])
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }

    async fn get_vote_info_by_epoch_number(
        &self,
        start: u64,
        end: u64,
    ) -> anyhow::Result<Vec<VoteInfoRecord>> {
        let result = self
            .call(
                "sbch_getVoteInfoByEpochNumber",
                vec![json!(start), json!(end)],
            )
            .await?;
        if result.is_null() {
            return Ok(vec![]);
        }
        Ok(serde_json::from_value(result)?)
    }
}

/// Retry-opaque wrapper around a [`WatcherRpc`] endpoint.
///
/// With `retry_forever` the calls do not return until a usable value is
/// obtained, sleeping between attempts; without it a single bounded retry
/// pass runs and unavailability surfaces as `0` / `None`.
#[derive(Clone)]
pub struct RpcFacade {
    inner: Arc<dyn WatcherRpc>,
    retry_delay: Duration,
    max_retry_duration: Duration,
    metrics: Option<Arc<WatcherMetrics>>,
}

impl RpcFacade {
    pub fn new(inner: Arc<dyn WatcherRpc>) -> Self {
        Self {
            inner,
            retry_delay: Duration::from_secs(5),
            max_retry_duration: Duration::from_secs(60),
            metrics: None,
        }
    }

    /// Attach metrics for monitoring
    pub fn with_metrics(mut self, metrics: Arc<WatcherMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shrink the retry pacing, used by tests.
    pub fn with_retry_timing(mut self, retry_delay: Duration, max_retry_duration: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.max_retry_duration = max_retry_duration;
        self
    }

    pub fn inner(&self) -> Arc<dyn WatcherRpc> {
        self.inner.clone()
    }

    fn record_query(&self, method: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.mainnet_rpc_queries.with_label_values(&[method]).inc();
        }
    }

    fn record_error(&self, method: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.mainnet_rpc_errors.with_label_values(&[method]).inc();
        }
    }

    pub async fn latest_height(&self, retry_forever: bool) -> i64 {
        loop {
            self.record_query("getblockcount");
            match retry_with_max_elapsed_time!(
                self.inner.get_latest_height(),
                self.max_retry_duration
            ) {
                Ok(Ok(height)) if height > 0 => return height,
                Ok(Ok(height)) => {
                    if !retry_forever {
                        return height;
                    }
                    debug!(height, "mainchain height not yet available");
                }
                _ => {
                    self.record_error("getblockcount");
                    warn!("failed to fetch mainchain height after retries");
                    if !retry_forever {
                        return 0;
                    }
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    pub async fn block_by_height(&self, height: i64, retry_forever: bool) -> Option<MainchainBlock> {
        loop {
            self.record_query("getblockbyheight");
            match retry_with_max_elapsed_time!(
                self.inner.get_block_by_height(height),
                self.max_retry_duration
            ) {
                Ok(Ok(Some(block))) => return Some(block),
                Ok(Ok(None)) => {
                    if !retry_forever {
                        return None;
                    }
                    debug!(height, "mainchain block not yet available");
                }
                _ => {
                    self.record_error("getblockbyheight");
                    warn!(height, "failed to fetch mainchain block after retries");
                    if !retry_forever {
                        return None;
                    }
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    pub async fn block_info_by_height(
        &self,
        height: i64,
        retry_forever: bool,
    ) -> Option<MainchainBlockInfo> {
        loop {
            self.record_query("getblockinfobyheight");
            match retry_with_max_elapsed_time!(
                self.inner.get_block_info_by_height(height),
                self.max_retry_duration
            ) {
                Ok(Ok(Some(info))) => return Some(info),
                Ok(Ok(None)) => {
                    if !retry_forever {
                        return None;
                    }
                    debug!(height, "mainchain block info not yet available");
                }
                _ => {
                    self.record_error("getblockinfobyheight");
                    warn!(height, "failed to fetch block info after retries");
                    if !retry_forever {
                        return None;
                    }
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Fast-sync batch fetch. Errors degrade to an empty batch, which the
    /// primer treats as end-of-history.
    pub async fn vote_info_by_epoch_number(&self, start: u64, end: u64) -> Vec<VoteInfoRecord> {
        self.record_query("sbch_getVoteInfoByEpochNumber");
        match self.inner.get_vote_info_by_epoch_number(start, end).await {
            Ok(infos) => infos,
            Err(err) => {
                self.record_error("sbch_getVoteInfoByEpochNumber");
                warn!(start, end, "failed to fetch vote infos: {:?}", err);
                vec![]
            }
        }
    }
}

impl std::fmt::Debug for RpcFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFacade")
            .field("retry_delay", &self.retry_delay)
            .field("max_retry_duration", &self.max_retry_duration)
            .finish()
    }
}
