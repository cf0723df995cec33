//! Stateless REST adapter
//!
//! Maps `"METHOD /path"` operations onto HTTP requests against a configured
//! base URL. The params object may carry `query` (map), `body` (any JSON),
//! and `headers` (map); per-request headers override configured ones. Bearer
//! credentials are referenced by env var name and resolved at connect, so
//! they never live in config files and are never echoed in errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, header};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{Adapter, AdapterKind, AdapterMetadata, AdapterRequest, AdapterResponse, Capability};
use crate::{Error, Result};

/// Upstream error bodies are clipped to this many chars in error messages
const ERROR_BODY_LIMIT: usize = 200;

/// REST adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    /// Base URL operation paths are appended to
    pub base_url: String,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// HTTP client timeout (doubles as the per-execute deadline)
    #[serde(default = "default_timeout", with = "crate::config::humantime_serde")]
    pub timeout: Duration,
    /// Name of the env var holding the bearer token, resolved at connect
    #[serde(default)]
    pub bearer_env: Option<String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Stateless HTTP adapter (one `reqwest` client, no per-call state)
pub struct RestAdapter {
    config: RestConfig,
    client: Client,
    /// Resolved bearer token; never logged
    bearer: RwLock<Option<String>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for RestAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAdapter")
            .field("config", &self.config)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl RestAdapter {
    /// Parse the config object and build the HTTP client
    ///
    /// # Errors
    ///
    /// Returns `Error::AdapterConfig` when the object does not deserialize
    /// or the client cannot be built.
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: RestConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::AdapterConfig(format!("rest config: {e}")))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::AdapterConfig(format!("http client: {e}")))?;

        Ok(Self {
            config,
            client,
            bearer: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Adapter for RestAdapter {
    async fn connect(&self) -> Result<()> {
        let url = Url::parse(&self.config.base_url)
            .map_err(|e| Error::AdapterConfig(format!("invalid base_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::AdapterConfig(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        if let Some(var) = &self.config.bearer_env {
            let token = std::env::var(var)
                .map_err(|_| Error::AdapterConfig(format!("bearer env var not set: {var}")))?;
            *self.bearer.write() = Some(token);
        }

        self.connected.store(true, Ordering::Relaxed);
        debug!(base_url = %self.config.base_url, "REST adapter connected");
        Ok(())
    }

    async fn execute(&self, request: &AdapterRequest) -> Result<AdapterResponse> {
        let (method, path) = parse_operation(&request.operation)?;
        let url = join_url(&self.config.base_url, path);

        let mut headers = header::HeaderMap::new();
        for (key, value) in &self.config.headers {
            if let (Ok(k), Ok(v)) = (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                headers.insert(k, v);
            }
        }
        // Per-request headers override configured ones
        if let Some(extra) = request.params.get("headers").and_then(Value::as_object) {
            for (key, value) in extra {
                let Some(value) = value.as_str() else { continue };
                if let (Ok(k), Ok(v)) = (
                    key.parse::<header::HeaderName>(),
                    value.parse::<header::HeaderValue>(),
                ) {
                    headers.insert(k, v);
                }
            }
        }

        let mut builder = self.client.request(method, &url).headers(headers);

        let bearer = self.bearer.read().clone();
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        if let Some(query) = request.params.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), query_value(v)))
                .collect();
            builder = builder.query(&pairs);
        }

        if let Some(body) = request.params.get("body") {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| Error::AdapterExecution {
            status: None,
            message: format!("request failed: {e}"),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| Error::AdapterExecution {
            status: Some(status.as_u16()),
            message: format!("failed to read body: {e}"),
        })?;

        if !status.is_success() {
            return Err(Error::AdapterExecution {
                status: Some(status.as_u16()),
                message: clip(&text),
            });
        }

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }))
        };

        Ok(AdapterResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn metadata(&self) -> AdapterMetadata {
        AdapterMetadata {
            kind: AdapterKind::Rest,
            target: self.config.base_url.clone(),
            capabilities: vec![Capability::Read, Capability::Write],
        }
    }

    fn is_cacheable(&self, request: &AdapterRequest) -> bool {
        match parse_operation(&request.operation) {
            Ok((method, _)) => method == Method::GET || method == Method::HEAD,
            Err(_) => false,
        }
    }

    async fn health_check(&self) -> Result<()> {
        // Any response, even an error status, proves the target is reachable
        self.client
            .head(&self.config.base_url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Error::AdapterExecution {
                status: None,
                message: format!("health check failed: {e}"),
            })
    }
}

/// Split `"METHOD /path"`; a bare path is a GET
fn parse_operation(operation: &str) -> Result<(Method, &str)> {
    match operation.split_once(' ') {
        Some((method, path)) => {
            let parsed = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(
                |_| Error::AdapterExecution {
                    status: None,
                    message: format!("invalid HTTP method: {method}"),
                },
            )?;
            Ok((parsed, path.trim_start()))
        }
        None => Ok((Method::GET, operation)),
    }
}

/// Append an operation path to the base URL
fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Render a JSON value as a query scalar (strings unquoted)
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Clip upstream error text so audit lines stay bounded
fn clip(text: &str) -> String {
    if text.chars().count() <= ERROR_BODY_LIMIT {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(ERROR_BODY_LIMIT).collect();
        format!("{clipped}...")
    }
}
