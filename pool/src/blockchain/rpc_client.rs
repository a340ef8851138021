/// Node RPC client - JSON-RPC over HTTP with a circuit breaker
///
/// Talks `getblocktemplate` / `submitblock` / `getblockcount` / `getblockhash`
/// to a bitcoind-style node. After
/// five transport failures in a row the breaker opens and calls fail fast for
/// a minute before a half-open retry.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, header, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::template_manager::BlockTemplate;
use crate::metrics::prometheus as metrics;

/// What the pool needs from a full node
#[async_trait]
pub trait NodePeer: Send + Sync {
    async fn get_block_template(&self) -> Result<BlockTemplate>;

    /// `Ok(true)` when the node accepted the block
    async fn submit_block(&self, block_hex: &str) -> Result<bool>;

    /// Height of the node's best chain tip
    async fn best_height(&self) -> Result<u64>;

    /// Hash of the best-chain block at `height`
    async fn block_hash(&self, height: u64) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "Node RPC circuit breaker tripped after {} failures, pausing for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Node RPC circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("Node RPC circuit breaker half-open");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(anyhow!("node RPC circuit breaker is open"));
                }
            }
        }
        Ok(())
    }
}

/// Reads the node's verdict on a submitted block. bitcoind answers `null`
/// on success and a reason string otherwise.
fn submit_accepted(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("accepted"),
        Value::Object(obj) => obj
            .get("accepted")
            .and_then(|v| v.as_bool())
            .or_else(|| {
                obj.get("status")
                    .and_then(|s| s.as_str())
                    .map(|s| s.eq_ignore_ascii_case("accepted"))
            })
            .unwrap_or(false),
        _ => false,
    }
}

pub struct NodeRpcClient {
    url: String,
    auth: Option<String>,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Mutex<CircuitBreaker>,
    next_id: AtomicU64,
}

impl NodeRpcClient {
    pub fn new(
        url: impl Into<String>,
        user: Option<&str>,
        password: Option<&str>,
        timeout: Option<Duration>,
    ) -> Self {
        let url = url.into();
        let auth = user.map(|u| {
            let creds = format!("{}:{}", u, password.unwrap_or(""));
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(creds)
            )
        });

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("Node RPC client initialized: {}", url);

        Self {
            url,
            auth,
            timeout: timeout.unwrap_or(Duration::from_secs(30)),
            client,
            circuit_breaker: Mutex::new(CircuitBreaker::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One JSON-RPC call. Transport failures count against the breaker,
    /// RPC-level errors do not.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();
        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        self.circuit_breaker.lock().check()?;

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };
        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = &self.auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        let req = builder.body(body)?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.circuit_breaker.lock().record_failure();
                return Err(anyhow!("RPC connection failed: {}", e));
            }
            Err(_) => {
                self.circuit_breaker.lock().record_failure();
                return Err(anyhow!("RPC request timeout"));
            }
        };

        let status = response.status();
        let body_bytes = match response.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                self.circuit_breaker.lock().record_failure();
                return Err(anyhow!("RPC body read failed: {}", e));
            }
        };

        // bitcoind reports RPC errors with HTTP 500 and a JSON body
        let rpc_response: RpcResponse = match serde_json::from_reader(body_bytes.reader()) {
            Ok(r) => r,
            Err(e) => {
                if !status.is_success() {
                    self.circuit_breaker.lock().record_failure();
                    return Err(anyhow!("RPC HTTP error: {}", status));
                }
                return Err(anyhow!("RPC response not JSON: {}", e));
            }
        };

        self.circuit_breaker.lock().record_success();

        if let Some(error) = rpc_response.error.filter(|e| !e.is_null()) {
            tracing::warn!("RPC {} error: {}", method, error);
            return Err(anyhow!("RPC error: {}", error));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl NodePeer for NodeRpcClient {
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        let params = json!([{ "rules": ["segwit"] }]);
        let result = match self.call("getblocktemplate", params.clone()).await {
            Ok(v) => v,
            Err(_) => self.call("getBlockTemplate", params).await?,
        };
        BlockTemplate::from_rpc_response(result)
    }

    async fn submit_block(&self, block_hex: &str) -> Result<bool> {
        let params = json!([block_hex]);

        // Support both lowercase and camelCase method names
        let result = match self.call("submitblock", params.clone()).await {
            Ok(v) => v,
            Err(_) => self.call("submitBlock", params).await?,
        };

        let accepted = submit_accepted(&result);
        if !accepted {
            tracing::error!("submitblock rejected: {}", result);
        }
        Ok(accepted)
    }

    async fn best_height(&self) -> Result<u64> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| anyhow!("getblockcount returned {}", result))
    }

    async fn block_hash(&self, height: u64) -> Result<String> {
        let result = self.call("getblockhash", json!([height])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("getblockhash returned {}", result))
    }
}
