//! Adapter management
//!
//! An adapter connects the pipeline to one backend system. The registry owns
//! every live instance: creation parses and validates the kind-specific
//! configuration, connects, and files the instance under a fresh uuid;
//! lookups are lock-free; every execute is bounded by the instance timeout.
//! Structural map changes happen only on create and destroy, so concurrent
//! executes against distinct instances never contend.

mod rest;
mod sql;

pub use self::rest::RestAdapter;
pub use self::sql::SqlAdapter;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::humantime_serde;
use crate::{Error, Result};

/// Execute deadline for instances whose config does not set one
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// A single call into an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRequest {
    /// Operation name (`"GET /path"` for REST, `"query"`/`"execute"` for SQL)
    pub operation: String,
    /// Operation parameters
    #[serde(default)]
    pub params: Value,
}

impl AdapterRequest {
    /// Build a request
    #[must_use]
    pub fn new(operation: &str, params: Value) -> Self {
        Self {
            operation: operation.to_string(),
            params,
        }
    }
}

/// Normalized adapter result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterResponse {
    /// Upstream status (HTTP status for REST, 200 for a completed statement)
    pub status: u16,
    /// Response payload
    pub body: Value,
}

/// Supported adapter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Stateless HTTP adapter
    Rest,
    /// Stateful embedded SQL adapter
    Sql,
}

impl AdapterKind {
    /// Wire name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Sql => "sql",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rest" => Ok(Self::Rest),
            "sql" => Ok(Self::Sql),
            other => Err(Error::AdapterConfig(format!("unknown adapter kind: {other}"))),
        }
    }
}

/// Declared adapter capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Idempotent reads
    Read,
    /// State-changing operations
    Write,
}

/// Adapter self-description (credentials elided from `target`)
#[derive(Debug, Clone, Serialize)]
pub struct AdapterMetadata {
    /// Adapter kind
    pub kind: AdapterKind,
    /// Connection target (base URL, database path)
    pub target: String,
    /// Declared capabilities
    pub capabilities: Vec<Capability>,
}

/// Adapter trait for backend connectors
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Establish or verify the underlying connection
    async fn connect(&self) -> Result<()>;

    /// Execute one operation
    async fn execute(&self, request: &AdapterRequest) -> Result<AdapterResponse>;

    /// Release held resources; executes queued behind a close fail cleanly
    async fn close(&self) -> Result<()>;

    /// Self-description
    fn metadata(&self) -> AdapterMetadata;

    /// Whether this request's response may be cached. Only idempotent
    /// operations return true; the cache layer never second-guesses this.
    fn is_cacheable(&self, request: &AdapterRequest) -> bool;

    /// Cheap liveness probe
    async fn health_check(&self) -> Result<()>;
}

/// A live adapter instance with its lifecycle metadata
pub struct AdapterInstance {
    /// Instance id (uuid v4), the handle callers use
    pub id: String,
    /// Adapter kind
    pub kind: AdapterKind,
    /// Subject that created the instance
    pub owner: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Per-execute deadline
    pub timeout: Duration,
    /// The adapter itself
    adapter: Box<dyn Adapter>,
}

impl std::fmt::Debug for AdapterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterInstance")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AdapterInstance {
    /// Whether a request against this instance may be served from cache
    #[must_use]
    pub fn is_cacheable(&self, request: &AdapterRequest) -> bool {
        self.adapter.is_cacheable(request)
    }

    /// The adapter's self-description
    #[must_use]
    pub fn metadata(&self) -> AdapterMetadata {
        self.adapter.metadata()
    }

    /// Probe the underlying connection
    ///
    /// # Errors
    ///
    /// Returns the adapter's probe failure.
    pub async fn health_check(&self) -> Result<()> {
        self.adapter.health_check().await
    }
}

/// Registry of live adapter instances
pub struct AdapterRegistry {
    /// Instances by id
    instances: DashMap<String, Arc<AdapterInstance>>,
    /// Execute deadline for instances that don't set their own
    default_timeout: Duration,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTE_TIMEOUT)
    }
}

impl AdapterRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            instances: DashMap::new(),
            default_timeout,
        }
    }

    /// Create, connect, and register an adapter instance under a fresh uuid
    ///
    /// The config object is parsed per kind; an optional top-level `timeout`
    /// (humantime string or seconds) overrides the registry default as the
    /// per-execute deadline.
    ///
    /// # Errors
    ///
    /// Returns `Error::AdapterConfig` when the configuration does not parse
    /// or the initial connect fails. Nothing is registered on failure.
    pub async fn create(
        &self,
        kind: AdapterKind,
        config: &Value,
        owner: &str,
    ) -> Result<Arc<AdapterInstance>> {
        let id = Uuid::new_v4().to_string();
        self.create_with_id(&id, kind, config, owner).await
    }

    /// Create an instance addressable by a stable name instead of a uuid
    /// (configuration-declared boot instances)
    ///
    /// # Errors
    ///
    /// Like [`AdapterRegistry::create`], plus `Error::AdapterConfig` when the
    /// name is already taken.
    pub async fn create_named(
        &self,
        name: &str,
        kind: AdapterKind,
        config: &Value,
        owner: &str,
    ) -> Result<Arc<AdapterInstance>> {
        if name.is_empty() {
            return Err(Error::AdapterConfig("instance name is empty".to_string()));
        }
        if self.instances.contains_key(name) {
            return Err(Error::AdapterConfig(format!(
                "instance name already taken: {name}"
            )));
        }
        self.create_with_id(name, kind, config, owner).await
    }

    async fn create_with_id(
        &self,
        id: &str,
        kind: AdapterKind,
        config: &Value,
        owner: &str,
    ) -> Result<Arc<AdapterInstance>> {
        let timeout = instance_timeout(config, self.default_timeout)?;

        let adapter: Box<dyn Adapter> = match kind {
            AdapterKind::Rest => Box::new(RestAdapter::from_config(config)?),
            AdapterKind::Sql => Box::new(SqlAdapter::from_config(config)?),
        };

        adapter
            .connect()
            .await
            .map_err(|e| Error::AdapterConfig(format!("connect failed: {e}")))?;

        Ok(self.register(id, kind, owner, timeout, adapter))
    }

    /// Register a connected adapter under `id`
    ///
    /// The `create*` methods are the config-driven path; this is the seam
    /// for pre-built adapters.
    pub fn register(
        &self,
        id: &str,
        kind: AdapterKind,
        owner: &str,
        timeout: Duration,
        adapter: Box<dyn Adapter>,
    ) -> Arc<AdapterInstance> {
        let instance = Arc::new(AdapterInstance {
            id: id.to_string(),
            kind,
            owner: owner.to_string(),
            created_at: Utc::now(),
            timeout,
            adapter,
        });
        self.instances
            .insert(instance.id.clone(), Arc::clone(&instance));
        info!(instance = %instance.id, kind = %kind, owner = %owner, "Adapter instance created");
        instance
    }

    /// Get an instance by id
    ///
    /// # Errors
    ///
    /// Returns `Error::AdapterNotFound` for unknown ids.
    pub fn get(&self, id: &str) -> Result<Arc<AdapterInstance>> {
        self.instances
            .get(id)
            .map(|i| Arc::clone(&*i))
            .ok_or_else(|| Error::AdapterNotFound(id.to_string()))
    }

    /// Remove an instance and close its adapter
    ///
    /// In-flight executes hold their own `Arc` and finish normally; stateful
    /// adapters serialize the close behind them on their own lock.
    ///
    /// # Errors
    ///
    /// Returns `Error::AdapterNotFound` for unknown ids, or the adapter's
    /// close failure.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let (_, instance) = self
            .instances
            .remove(id)
            .ok_or_else(|| Error::AdapterNotFound(id.to_string()))?;

        instance.adapter.close().await?;
        info!(instance = %id, "Adapter instance destroyed");
        Ok(())
    }

    /// Execute a request against an instance, bounded by its timeout
    ///
    /// # Errors
    ///
    /// Returns `Error::AdapterNotFound` for unknown ids,
    /// `Error::AdapterTimeout` when the deadline elapses, or the adapter's
    /// own execution failure.
    pub async fn execute(&self, id: &str, request: &AdapterRequest) -> Result<AdapterResponse> {
        let instance = self.get(id)?;
        let start = Instant::now();

        let result = match tokio::time::timeout(instance.timeout, instance.adapter.execute(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::AdapterTimeout(instance.timeout)),
        };

        let latency = start.elapsed();
        match &result {
            Ok(response) => debug!(
                instance = %id,
                operation = %request.operation,
                status = response.status,
                latency_ms = latency.as_millis(),
                "Adapter execute completed"
            ),
            Err(e) => warn!(
                instance = %id,
                operation = %request.operation,
                error = %e,
                latency_ms = latency.as_millis(),
                "Adapter execute failed"
            ),
        }

        result
    }

    /// Ids of all live instances
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.key().clone()).collect()
    }

    /// Number of live instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the registry holds no instances
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Close every instance (shutdown path); close failures are logged
    pub async fn close_all(&self) {
        for id in self.instance_ids() {
            if let Some((_, instance)) = self.instances.remove(&id) {
                if let Err(e) = instance.adapter.close().await {
                    warn!(instance = %id, error = %e, "Failed to close adapter");
                }
            }
        }
    }
}

/// Resolve the per-execute deadline from the shared config envelope
fn instance_timeout(config: &Value, default: Duration) -> Result<Duration> {
    match config.get("timeout") {
        None => Ok(default),
        Some(Value::String(s)) => humantime_serde::parse_duration(s)
            .ok_or_else(|| Error::AdapterConfig(format!("invalid timeout: {s}"))),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| Error::AdapterConfig(format!("invalid timeout: {n}"))),
        Some(other) => Err(Error::AdapterConfig(format!("invalid timeout: {other}"))),
    }
}
