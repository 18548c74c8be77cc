//! JSON-RPC over HTTP, shared by the getwork and block-template clients.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use reqwest::header::HeaderMap;
use reqwest::{Client, Proxy, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{PoolConfig, Tuning};
use crate::connection::ConnectionPool;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// A decoded reply plus the transport details callers care about.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub result: Value,
    pub error: Option<Value>,
    pub headers: HeaderMap,
    pub latency: Duration,
}

impl RpcReply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Human readable form of the JSON-RPC error, if any.
    pub fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        Some(match error.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        })
    }
}

fn build_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder().pool_max_idle_per_host(1);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Bare `host:port` pool urls default to http.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

pub struct RpcTransport {
    url: String,
    user: String,
    pass: String,
    timeout: Duration,
    connections: Arc<ConnectionPool<Client>>,
    next_id: AtomicU64,
}

impl RpcTransport {
    pub fn new(config: &PoolConfig, tuning: &Tuning) -> Result<Self> {
        let url = normalize_url(&config.url);
        Url::parse(&url).map_err(|e| EngineError::Config(format!("bad pool url '{}': {}", url, e)))?;
        let proxy = config.proxy.clone();
        let connections = ConnectionPool::new(tuning.connection_limit(), move || {
            build_client(proxy.as_deref())
        });
        Ok(Self {
            url,
            user: config.user.clone(),
            pass: config.pass.clone(),
            timeout: tuning.request_timeout,
            connections,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn connections(&self) -> &Arc<ConnectionPool<Client>> {
        &self.connections
    }

    /// Resolve a long-poll path against the pool url.
    pub fn resolve(&self, path: &str) -> Result<String> {
        let base = Url::parse(&self.url).map_err(|e| EngineError::Config(e.to_string()))?;
        let joined = base
            .join(path)
            .map_err(|e| EngineError::Decode(format!("bad long poll url '{}': {}", path, e)))?;
        Ok(joined.to_string())
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<RpcReply> {
        self.call_at(&self.url, method, params, self.timeout).await
    }

    pub async fn call_at(&self, url: &str, method: &str, params: Value, timeout: Duration) -> Result<RpcReply> {
        let request = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };
        let lease = self.connections.acquire().await?;
        let started = Instant::now();
        let sent = lease
            .post(url)
            .basic_auth(&self.user, Some(&self.pass))
            .timeout(timeout)
            .json(&request)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                lease.invalidate();
                return Err(e.into());
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                lease.invalidate();
                return Err(e.into());
            }
        };
        drop(lease);
        let latency = started.elapsed();

        // bitcoind answers errors with HTTP 500 and a JSON body
        let decoded: RpcResponse = match serde_json::from_slice(&body) {
            Ok(decoded) => decoded,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => return Err(EngineError::Transport(format!("HTTP {} from {}", status, url))),
        };
        debug!("{} answered {} in {:?}", method, status, latency);
        Ok(RpcReply {
            result: decoded.result.unwrap_or(Value::Null),
            error: decoded.error.filter(|e| !e.is_null()),
            headers,
            latency,
        })
    }

    pub fn reap(&self, max_idle: Duration) -> usize {
        self.connections.reap(max_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;

    fn transport(url: &str) -> RpcTransport {
        let tuning = Tuning::from_config(&EngineConfig::default()).unwrap();
        RpcTransport::new(&PoolConfig::new(url), &tuning).unwrap()
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("127.0.0.1:8332"), "http://127.0.0.1:8332");
        assert_eq!(normalize_url(" https://pool.example/rpc "), "https://pool.example/rpc");
    }

    #[test]
    fn test_resolve_long_poll_path() {
        let rpc = transport("http://pool.example:8332/");
        assert_eq!(rpc.resolve("/LP").unwrap(), "http://pool.example:8332/LP");
        assert_eq!(
            rpc.resolve("http://lp.example:9000/wait").unwrap(),
            "http://lp.example:9000/wait"
        );
    }

    #[test]
    fn test_error_message() {
        let reply = RpcReply {
            result: Value::Null,
            error: Some(json!({"code": -8, "message": "bad data"})),
            headers: HeaderMap::new(),
            latency: Duration::ZERO,
        };
        assert_eq!(reply.error_message().as_deref(), Some("bad data"));
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let decoded: RpcResponse = serde_json::from_str(r#"{"result": true}"#).unwrap();
        assert_eq!(decoded.result, Some(Value::Bool(true)));
        assert!(decoded.error.is_none());
    }
}
