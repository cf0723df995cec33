//! Request dispatch pipeline
//!
//! Every call flows through one fixed sequence: authenticate the bearer,
//! authorize the (roles, operation) pair, consult the response cache (only
//! for cacheable executes, only after authorization), invoke the adapter,
//! store a cacheable success, record exactly one audit event, respond.
//! Failures at any stage short-circuit forward to audit and response; they
//! never skip audit. A drop guard records an abort event for dispatches
//! cancelled mid-flight, so the one-event-per-call property holds even then.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::adapter::{AdapterKind, AdapterRegistry, AdapterRequest, DEFAULT_EXECUTE_TIMEOUT};
use crate::audit::{AuditEvent, AuditLog, FileSink};
use crate::auth::{PermissionTable, TokenIdentity, TokenStore, spawn_reaper};
use crate::cache::{CacheStatsSnapshot, ResponseCache};
use crate::config::{AuditSinkKind, CacheConfig, Config};
use crate::error::AuthFailure;
use crate::{Error, Result};

/// A call entering the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ToolCall {
    /// Exchange subject credentials for a bearer token (the public operation)
    Login {
        /// Subject name
        subject: String,
        /// Subject secret
        secret: String,
    },
    /// Create an adapter instance
    CreateAdapter {
        /// Adapter kind
        kind: AdapterKind,
        /// Kind-specific configuration object
        config: Value,
    },
    /// Execute an operation against an instance
    ExecuteAdapter {
        /// Instance id (uuid or configured name)
        instance: String,
        /// Adapter operation
        operation: String,
        /// Operation parameters
        #[serde(default)]
        params: Value,
    },
    /// Read an instance's metadata, or list live instance ids
    ReadAdapter {
        /// Instance id; `None` lists all live instances
        instance: Option<String>,
    },
    /// Destroy an instance and drop its cached responses
    DestroyAdapter {
        /// Instance id
        instance: String,
    },
    /// Revoke a previously issued token
    RevokeToken {
        /// The bearer to revoke
        token: String,
    },
}

impl ToolCall {
    /// The authorization and audit operation name for this call
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Login { .. } => "auth.login",
            Self::CreateAdapter { .. } => "adapter.create",
            Self::ExecuteAdapter { .. } => "adapter.execute",
            Self::ReadAdapter { .. } => "adapter.read",
            Self::DestroyAdapter { .. } => "adapter.destroy",
            Self::RevokeToken { .. } => "auth.revoke",
        }
    }
}

/// How the cache participated in a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from cache, adapter not invoked
    Hit,
    /// Cacheable but absent; invoked live and stored
    Miss,
    /// Not cacheable (or caching disabled); cache skipped
    Bypass,
}

/// Pipeline result for a successful dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    /// HTTP-style status
    pub status: u16,
    /// Response payload
    pub body: Value,
    /// Cache participation
    pub cache: CacheStatus,
}

impl DispatchOutcome {
    fn bypass(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            cache: CacheStatus::Bypass,
        }
    }
}

/// The security-and-dispatch pipeline
pub struct Dispatcher {
    tokens: Arc<TokenStore>,
    permissions: PermissionTable,
    cache: ResponseCache,
    cache_config: CacheConfig,
    registry: AdapterRegistry,
    audit: AuditLog,
    /// Stops the expired-record reaper on shutdown (config-built pipelines)
    reaper_shutdown: Option<tokio::sync::broadcast::Sender<()>>,
}

impl Dispatcher {
    /// Assemble a pipeline from its parts
    #[must_use]
    pub fn new(
        tokens: Arc<TokenStore>,
        permissions: PermissionTable,
        cache_config: CacheConfig,
        registry: AdapterRegistry,
        audit: AuditLog,
    ) -> Self {
        Self {
            tokens,
            permissions,
            cache: ResponseCache::new(cache_config.max_entries),
            cache_config,
            registry,
            audit,
            reaper_shutdown: None,
        }
    }

    /// Build the full pipeline from configuration: token store with
    /// registered subjects, permission table, cache, audit sink, and any
    /// boot-time adapter instances (owner `"system"`, addressable by their
    /// configured names).
    ///
    /// # Errors
    ///
    /// Returns configuration errors from any component, including adapter
    /// configs that fail to parse or connect.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let secret = config.auth.resolve_secret();
        let tokens = TokenStore::new(secret.as_bytes(), config.auth.token_ttl)?;
        for subject in &config.auth.subjects {
            tokens.register_subject(&subject.name, &subject.resolve_secret(), subject.roles.clone());
        }

        let permissions = PermissionTable::from_config(&config.authz)?;

        let audit = match config.audit.sink {
            AuditSinkKind::Tracing => AuditLog::tracing(config.audit.ring_capacity),
            AuditSinkKind::File => {
                let path = config.audit.path.as_deref().ok_or_else(|| {
                    Error::Config("audit.path is required for the file sink".to_string())
                })?;
                AuditLog::new(
                    Box::new(FileSink::open(std::path::Path::new(path))?),
                    config.audit.ring_capacity,
                )
            }
        };

        let mut dispatcher = Self::new(
            Arc::new(tokens),
            permissions,
            config.cache.clone(),
            AdapterRegistry::new(DEFAULT_EXECUTE_TIMEOUT),
            audit,
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        spawn_reaper(
            Arc::clone(&dispatcher.tokens),
            config.auth.reap_interval,
            shutdown_rx,
        );
        dispatcher.reaper_shutdown = Some(shutdown_tx);

        for (name, seed) in &config.adapters {
            let kind: AdapterKind = seed.kind.parse()?;
            dispatcher
                .registry
                .create_named(name, kind, &seed.config, "system")
                .await?;
        }

        Ok(dispatcher)
    }

    /// Dispatch one call through the pipeline
    ///
    /// Exactly one audit event is recorded per invocation, whatever the
    /// outcome; if the returned future is dropped before completing, the
    /// drop guard records a `dispatch.abort` instead.
    ///
    /// # Errors
    ///
    /// Authentication, authorization, and adapter failures surface as their
    /// respective [`Error`] kinds. Cache and audit failures never do.
    #[tracing::instrument(skip(self, bearer, call), fields(operation = %call.operation()))]
    pub async fn dispatch(&self, bearer: Option<&str>, call: ToolCall) -> Result<DispatchOutcome> {
        let mut guard = AbortGuard::new(&self.audit, call.operation());
        let (event, result) = self.run(bearer, call, &mut guard).await;
        guard.finish(event);

        match &result {
            Ok(outcome) => {
                debug!(status = outcome.status, cache = ?outcome.cache, "Dispatch completed");
            }
            Err(e) => debug!(error = %e, "Dispatch failed"),
        }
        result
    }

    async fn run(
        &self,
        bearer: Option<&str>,
        call: ToolCall,
        guard: &mut AbortGuard<'_>,
    ) -> (AuditEvent, Result<DispatchOutcome>) {
        // Login carries its own credentials; no token demanded
        if let ToolCall::Login { subject, secret } = &call {
            return self.login(subject, secret);
        }

        let operation = call.operation();

        let identity = match self.authenticate(bearer) {
            Ok(identity) => identity,
            Err(e) => return (failure_event(&call, "-", &e), Err(e)),
        };
        guard.set_actor(&identity.subject);

        if let Err(e) = self.permissions.authorize(&identity.roles, operation) {
            let event = AuditEvent::authz_denied(&identity.subject, operation, &identity.roles);
            return (event, Err(e));
        }

        match call {
            ToolCall::CreateAdapter { kind, config } => {
                self.create_adapter(&identity, kind, &config).await
            }
            ToolCall::ExecuteAdapter {
                instance,
                operation,
                params,
            } => self.execute_adapter(&identity, &instance, &operation, params).await,
            ToolCall::ReadAdapter { instance } => {
                self.read_adapter(&identity, instance.as_deref())
            }
            ToolCall::DestroyAdapter { instance } => {
                self.destroy_adapter(&identity, &instance).await
            }
            ToolCall::RevokeToken { token } => self.revoke_token(&identity, &token),
            // Handled above before authentication
            ToolCall::Login { subject, secret } => self.login(&subject, &secret),
        }
    }

    fn authenticate(&self, bearer: Option<&str>) -> Result<TokenIdentity> {
        let token = bearer.ok_or(Error::Authentication(AuthFailure::Malformed))?;
        self.tokens.validate(token)
    }

    fn login(&self, subject: &str, secret: &str) -> (AuditEvent, Result<DispatchOutcome>) {
        match self.tokens.login(subject, secret) {
            Ok(issued) => {
                let body = json!({
                    "token": issued.token,
                    "token_id": issued.id,
                    "subject": issued.subject,
                    "roles": issued.roles,
                    "expires_at": issued.expires_at,
                });
                (
                    AuditEvent::login(subject),
                    Ok(DispatchOutcome::bypass(200, body)),
                )
            }
            Err(e) => (AuditEvent::login_failure(subject, &e.to_string()), Err(e)),
        }
    }

    async fn create_adapter(
        &self,
        identity: &TokenIdentity,
        kind: AdapterKind,
        config: &Value,
    ) -> (AuditEvent, Result<DispatchOutcome>) {
        let actor = identity.subject.as_str();
        match self.registry.create(kind, config, actor).await {
            Ok(instance) => {
                let body = json!({
                    "instance": instance.id,
                    "kind": kind,
                    "created_at": instance.created_at,
                });
                (
                    AuditEvent::adapter_create(actor, kind.as_str(), &instance.id),
                    Ok(DispatchOutcome::bypass(201, body)),
                )
            }
            Err(e) => (
                AuditEvent::adapter_create(actor, kind.as_str(), "-").failed(&e.to_string()),
                Err(e),
            ),
        }
    }

    async fn execute_adapter(
        &self,
        identity: &TokenIdentity,
        instance_id: &str,
        operation: &str,
        params: Value,
    ) -> (AuditEvent, Result<DispatchOutcome>) {
        let actor = identity.subject.as_str();
        let request = AdapterRequest::new(operation, params);

        // Cacheability is the adapter's declaration, so resolve first
        let instance = match self.registry.get(instance_id) {
            Ok(instance) => instance,
            Err(e) => {
                let event = AuditEvent::adapter_execute(actor, instance_id, operation)
                    .failed(&e.to_string());
                return (event, Err(e));
            }
        };

        let cacheable = self.cache_config.enabled
            && !self.cache_config.default_ttl.is_zero()
            && instance.is_cacheable(&request);

        let key = cacheable.then(|| {
            let actor_scope = self.cache_config.per_actor.then_some(actor);
            ResponseCache::build_key(actor_scope, instance_id, operation, &request.params)
        });

        if let Some(key) = &key {
            if let Some(cached) = self.cache.get(key) {
                debug!(instance = %instance_id, operation = %operation, "Cache hit");
                let status = cached
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(200);
                let body = cached.get("body").cloned().unwrap_or(Value::Null);
                let event = AuditEvent::adapter_execute(actor, instance_id, operation)
                    .with("cache", json!(CacheStatus::Hit));
                return (
                    event,
                    Ok(DispatchOutcome {
                        status,
                        body,
                        cache: CacheStatus::Hit,
                    }),
                );
            }
        }

        match self.registry.execute(instance_id, &request).await {
            Ok(response) => {
                let cache = if let Some(key) = &key {
                    self.cache.put(
                        key,
                        json!({ "status": response.status, "body": response.body }),
                        self.cache_config.default_ttl,
                    );
                    CacheStatus::Miss
                } else {
                    CacheStatus::Bypass
                };
                let event = AuditEvent::adapter_execute(actor, instance_id, operation)
                    .with("cache", json!(cache));
                (
                    event,
                    Ok(DispatchOutcome {
                        status: response.status,
                        body: response.body,
                        cache,
                    }),
                )
            }
            Err(e) => {
                let event = AuditEvent::adapter_execute(actor, instance_id, operation)
                    .failed(&e.to_string());
                (event, Err(e))
            }
        }
    }

    fn read_adapter(
        &self,
        identity: &TokenIdentity,
        instance_id: Option<&str>,
    ) -> (AuditEvent, Result<DispatchOutcome>) {
        let actor = identity.subject.as_str();
        let Some(id) = instance_id else {
            let mut instances = self.registry.instance_ids();
            instances.sort();
            return (
                AuditEvent::adapter_read(actor, "-"),
                Ok(DispatchOutcome::bypass(200, json!({ "instances": instances }))),
            );
        };

        match self.registry.get(id) {
            Ok(instance) => {
                let metadata = instance.metadata();
                let body = json!({
                    "instance": instance.id,
                    "kind": instance.kind,
                    "owner": instance.owner,
                    "created_at": instance.created_at,
                    "target": metadata.target,
                    "capabilities": metadata.capabilities,
                });
                (
                    AuditEvent::adapter_read(actor, id),
                    Ok(DispatchOutcome::bypass(200, body)),
                )
            }
            Err(e) => (
                AuditEvent::adapter_read(actor, id).failed(&e.to_string()),
                Err(e),
            ),
        }
    }

    async fn destroy_adapter(
        &self,
        identity: &TokenIdentity,
        instance_id: &str,
    ) -> (AuditEvent, Result<DispatchOutcome>) {
        let actor = identity.subject.as_str();
        match self.registry.destroy(instance_id).await {
            Ok(()) => {
                let dropped = self.cache.invalidate_prefix(&format!("{instance_id}:"));
                if dropped > 0 {
                    debug!(instance = %instance_id, dropped, "Dropped cached responses");
                }
                (
                    AuditEvent::adapter_destroy(actor, instance_id),
                    Ok(DispatchOutcome::bypass(
                        200,
                        json!({ "destroyed": instance_id }),
                    )),
                )
            }
            Err(e) => (
                AuditEvent::adapter_destroy(actor, instance_id).failed(&e.to_string()),
                Err(e),
            ),
        }
    }

    fn revoke_token(
        &self,
        identity: &TokenIdentity,
        token: &str,
    ) -> (AuditEvent, Result<DispatchOutcome>) {
        let actor = identity.subject.as_str();
        match self.tokens.revoke(token) {
            Ok(token_id) => (
                AuditEvent::revoked(actor).with("token_id", json!(token_id)),
                Ok(DispatchOutcome::bypass(200, json!({ "revoked": token_id }))),
            ),
            Err(e) => (AuditEvent::revoked(actor).failed(&e.to_string()), Err(e)),
        }
    }

    /// The token store behind this pipeline
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// The adapter registry behind this pipeline
    #[must_use]
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// The audit log behind this pipeline
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Response cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Shutdown path: stop the reaper and close every adapter instance
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.reaper_shutdown {
            let _ = tx.send(());
        }
        self.registry.close_all().await;
    }
}

/// Builds the per-call failure event carrying the error as context
fn failure_event(call: &ToolCall, actor: &str, error: &Error) -> AuditEvent {
    let reason = error.to_string();
    match call {
        ToolCall::Login { subject, .. } => AuditEvent::login_failure(subject, &reason),
        ToolCall::CreateAdapter { kind, .. } => {
            AuditEvent::adapter_create(actor, kind.as_str(), "-").failed(&reason)
        }
        ToolCall::ExecuteAdapter {
            instance, operation, ..
        } => AuditEvent::adapter_execute(actor, instance, operation).failed(&reason),
        ToolCall::ReadAdapter { instance } => {
            AuditEvent::adapter_read(actor, instance.as_deref().unwrap_or("-")).failed(&reason)
        }
        ToolCall::DestroyAdapter { instance } => {
            AuditEvent::adapter_destroy(actor, instance).failed(&reason)
        }
        ToolCall::RevokeToken { .. } => AuditEvent::revoked(actor).failed(&reason),
    }
}

/// Records a `dispatch.abort` if the dispatch future is dropped before its
/// terminal event was recorded
struct AbortGuard<'a> {
    audit: &'a AuditLog,
    operation: &'static str,
    actor: Option<String>,
    armed: bool,
}

impl<'a> AbortGuard<'a> {
    fn new(audit: &'a AuditLog, operation: &'static str) -> Self {
        Self {
            audit,
            operation,
            actor: None,
            armed: true,
        }
    }

    fn set_actor(&mut self, actor: &str) {
        self.actor = Some(actor.to_string());
    }

    /// Record the terminal event and disarm
    fn finish(mut self, event: AuditEvent) {
        self.armed = false;
        self.audit.record(event);
    }
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let actor = self.actor.as_deref().unwrap_or("-");
            self.audit.record(AuditEvent::aborted(actor, self.operation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::adapter::{
        Adapter, AdapterMetadata, AdapterResponse, Capability,
    };
    use crate::config::AuthzConfig;

    /// Adapter double that sleeps before answering
    struct SlowAdapter {
        delay: Duration,
    }

    #[async_trait]
    impl Adapter for SlowAdapter {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, request: &AdapterRequest) -> Result<AdapterResponse> {
            tokio::time::sleep(self.delay).await;
            Ok(AdapterResponse {
                status: 200,
                body: json!({ "echo": request.operation }),
            })
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn metadata(&self) -> AdapterMetadata {
            AdapterMetadata {
                kind: AdapterKind::Rest,
                target: "test".to_string(),
                capabilities: vec![Capability::Read],
            }
        }

        fn is_cacheable(&self, _request: &AdapterRequest) -> bool {
            true
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn harness() -> Dispatcher {
        let tokens =
            TokenStore::new(b"dispatch-test-secret-32-bytes!!!", Duration::from_secs(3600))
                .unwrap();
        tokens.register_subject("alice", "wonderland", vec!["admin".to_string()]);
        tokens.register_subject("violet", "readonly", vec!["viewer".to_string()]);

        Dispatcher::new(
            Arc::new(tokens),
            PermissionTable::from_config(&AuthzConfig::default()).unwrap(),
            CacheConfig::default(),
            AdapterRegistry::new(Duration::from_secs(5)),
            AuditLog::tracing(64),
        )
    }

    async fn login(dispatcher: &Dispatcher, subject: &str, secret: &str) -> String {
        let outcome = dispatcher
            .dispatch(
                None,
                ToolCall::Login {
                    subject: subject.to_string(),
                    secret: secret.to_string(),
                },
            )
            .await
            .unwrap();
        outcome.body["token"].as_str().unwrap().to_string()
    }

    fn execute_call(instance: &str, operation: &str, params: Value) -> ToolCall {
        ToolCall::ExecuteAdapter {
            instance: instance.to_string(),
            operation: operation.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn login_returns_usable_token() {
        // GIVEN: a pipeline with a registered subject
        let dispatcher = harness();

        // WHEN: the subject logs in
        let token = login(&dispatcher, "alice", "wonderland").await;

        // THEN: the token authenticates a subsequent call
        assert!(dispatcher.tokens().validate(&token).is_ok());
        let recent = dispatcher.audit().recent(1);
        assert_eq!(recent[0].event, "auth.login");
        assert_eq!(recent[0].actor, "alice");
    }

    #[tokio::test]
    async fn login_failure_audits_once() {
        let dispatcher = harness();

        let err = dispatcher
            .dispatch(
                None,
                ToolCall::Login {
                    subject: "alice".to_string(),
                    secret: "wrong".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.auth_kind(), Some(AuthFailure::InvalidCredentials));
        assert_eq!(dispatcher.audit().len(), 1);
        assert_eq!(dispatcher.audit().recent(1)[0].event, "auth.login_failure");
    }

    #[tokio::test]
    async fn missing_bearer_is_rejected_and_audited() {
        // GIVEN: a pipeline and no bearer at all
        let dispatcher = harness();

        // WHEN: an execute arrives without a token
        let err = dispatcher
            .dispatch(None, execute_call("i-1", "query", json!({})))
            .await
            .unwrap_err();

        // THEN: authentication fails and exactly one failure event exists
        assert_eq!(err.auth_kind(), Some(AuthFailure::Malformed));
        assert_eq!(dispatcher.audit().len(), 1);
        let event = &dispatcher.audit().recent(1)[0];
        assert_eq!(event.event, "adapter.execute");
        assert_eq!(event.actor, "-");
    }

    #[tokio::test]
    async fn viewer_is_denied_create() {
        // GIVEN: a token holding only the viewer role
        let dispatcher = harness();
        let token = login(&dispatcher, "violet", "readonly").await;

        // WHEN: the viewer tries to create an adapter
        let err = dispatcher
            .dispatch(
                Some(&token),
                ToolCall::CreateAdapter {
                    kind: AdapterKind::Sql,
                    config: json!({ "path": ":memory:" }),
                },
            )
            .await
            .unwrap_err();

        // THEN: denial names the operation, and the audit event carries roles
        assert!(matches!(err, Error::Authorization { .. }));
        let event = &dispatcher.audit().recent(1)[0];
        assert_eq!(event.event, "authz.denied");
        assert_eq!(event.actor, "violet");
        assert_eq!(event.context["operation"], "adapter.create");
        assert_eq!(event.context["roles"], json!(["viewer"]));
    }

    #[tokio::test]
    async fn viewer_may_read_but_not_execute() {
        // GIVEN: an instance and a viewer-role token
        let dispatcher = harness();
        let admin = login(&dispatcher, "alice", "wonderland").await;
        let viewer = login(&dispatcher, "violet", "readonly").await;

        let created = dispatcher
            .dispatch(
                Some(&admin),
                ToolCall::CreateAdapter {
                    kind: AdapterKind::Sql,
                    config: json!({ "path": ":memory:" }),
                },
            )
            .await
            .unwrap();
        let instance = created.body["instance"].as_str().unwrap().to_string();

        // WHEN: the viewer reads the instance
        let read = dispatcher
            .dispatch(
                Some(&viewer),
                ToolCall::ReadAdapter {
                    instance: Some(instance.clone()),
                },
            )
            .await
            .unwrap();

        // THEN: metadata comes back, but an execute is still denied
        assert_eq!(read.body["instance"], json!(instance));
        assert_eq!(read.body["kind"], "sql");
        assert_eq!(read.body["owner"], "alice");
        assert!(dispatcher
            .dispatch(
                Some(&viewer),
                execute_call(&instance, "query", json!({ "sql": "SELECT 1" })),
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn read_without_instance_lists_ids() {
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;
        dispatcher.registry().register(
            "b-two",
            AdapterKind::Rest,
            "alice",
            Duration::from_secs(1),
            Box::new(SlowAdapter { delay: Duration::ZERO }),
        );
        dispatcher.registry().register(
            "a-one",
            AdapterKind::Rest,
            "alice",
            Duration::from_secs(1),
            Box::new(SlowAdapter { delay: Duration::ZERO }),
        );

        let outcome = dispatcher
            .dispatch(Some(&token), ToolCall::ReadAdapter { instance: None })
            .await
            .unwrap();

        // Sorted for stable output
        assert_eq!(outcome.body["instances"], json!(["a-one", "b-two"]));
        assert_eq!(dispatcher.audit().recent(1)[0].event, "adapter.read");
    }

    #[tokio::test]
    async fn sql_round_trip_with_cache() {
        // GIVEN: an admin and a SQL instance created through the pipeline
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;

        let created = dispatcher
            .dispatch(
                Some(&token),
                ToolCall::CreateAdapter {
                    kind: AdapterKind::Sql,
                    config: json!({ "path": ":memory:" }),
                },
            )
            .await
            .unwrap();
        assert_eq!(created.status, 201);
        let instance = created.body["instance"].as_str().unwrap().to_string();

        // WHEN: DML runs, then the same query twice
        let dml = dispatcher
            .dispatch(
                Some(&token),
                execute_call(
                    &instance,
                    "execute",
                    json!({ "sql": "CREATE TABLE t (n INTEGER)" }),
                ),
            )
            .await
            .unwrap();
        assert_eq!(dml.cache, CacheStatus::Bypass);

        let first = dispatcher
            .dispatch(
                Some(&token),
                execute_call(&instance, "query", json!({ "sql": "SELECT 1 AS one" })),
            )
            .await
            .unwrap();
        let second = dispatcher
            .dispatch(
                Some(&token),
                execute_call(&instance, "query", json!({ "sql": "SELECT 1 AS one" })),
            )
            .await
            .unwrap();

        // THEN: miss then hit, identical bodies, and the stats agree
        assert_eq!(first.cache, CacheStatus::Miss);
        assert_eq!(second.cache, CacheStatus::Hit);
        assert_eq!(first.body, second.body);
        assert_eq!(first.body, json!([{ "one": 1 }]));
        let stats = dispatcher.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.insertions, 1);
    }

    #[tokio::test]
    async fn destroy_drops_cached_responses() {
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;

        let created = dispatcher
            .dispatch(
                Some(&token),
                ToolCall::CreateAdapter {
                    kind: AdapterKind::Sql,
                    config: json!({ "path": ":memory:" }),
                },
            )
            .await
            .unwrap();
        let instance = created.body["instance"].as_str().unwrap().to_string();

        dispatcher
            .dispatch(
                Some(&token),
                execute_call(&instance, "query", json!({ "sql": "SELECT 2 AS two" })),
            )
            .await
            .unwrap();
        assert_eq!(dispatcher.cache_stats().size, 1);

        let destroyed = dispatcher
            .dispatch(
                Some(&token),
                ToolCall::DestroyAdapter {
                    instance: instance.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(destroyed.body["destroyed"], json!(instance));
        assert_eq!(dispatcher.cache_stats().size, 0);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn revoked_token_stops_working_immediately() {
        // GIVEN: a logged-in admin
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;

        // WHEN: the token revokes itself
        dispatcher
            .dispatch(
                Some(&token),
                ToolCall::RevokeToken {
                    token: token.clone(),
                },
            )
            .await
            .unwrap();

        // THEN: the very next call is rejected
        let err = dispatcher
            .dispatch(Some(&token), execute_call("i-1", "query", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.auth_kind(), Some(AuthFailure::Revoked));
        assert_eq!(dispatcher.audit().recent(2)[0].event, "auth.revoke");
    }

    #[tokio::test]
    async fn timeout_surfaces_and_stores_nothing() {
        // GIVEN: an instance whose executes exceed their deadline
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;
        dispatcher.registry().register(
            "slow",
            AdapterKind::Rest,
            "alice",
            Duration::from_millis(10),
            Box::new(SlowAdapter {
                delay: Duration::from_millis(200),
            }),
        );

        // WHEN: an execute times out
        let err = dispatcher
            .dispatch(Some(&token), execute_call("slow", "ping", json!({})))
            .await
            .unwrap_err();

        // THEN: the timeout surfaces, the failure audits, nothing is cached
        assert!(matches!(err, Error::AdapterTimeout(_)));
        let event = &dispatcher.audit().recent(1)[0];
        assert_eq!(event.event, "adapter.execute");
        assert!(event.context["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(dispatcher.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn dropped_dispatch_records_abort() {
        // GIVEN: an instance slow enough to outlive the caller's patience
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;
        dispatcher.registry().register(
            "slow",
            AdapterKind::Rest,
            "alice",
            Duration::from_secs(30),
            Box::new(SlowAdapter {
                delay: Duration::from_secs(30),
            }),
        );
        let before = dispatcher.audit().len();

        // WHEN: the dispatch future is dropped mid-invoke
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            dispatcher.dispatch(Some(&token), execute_call("slow", "ping", json!({}))),
        )
        .await;

        // THEN: the drop guard recorded exactly one abort event
        assert!(result.is_err());
        assert_eq!(dispatcher.audit().len(), before + 1);
        let event = &dispatcher.audit().recent(1)[0];
        assert_eq!(event.event, "dispatch.abort");
        assert_eq!(event.actor, "alice");
        assert_eq!(event.context["operation"], "adapter.execute");
    }

    #[tokio::test]
    async fn unknown_instance_fails_with_not_found() {
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;

        let err = dispatcher
            .dispatch(Some(&token), execute_call("ghost", "query", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AdapterNotFound(_)));
        assert_eq!(dispatcher.audit().recent(1)[0].event, "adapter.execute");
    }

    #[tokio::test]
    async fn every_dispatch_audits_exactly_once() {
        // A mixed batch of successes and failures, one event each
        let dispatcher = harness();
        let token = login(&dispatcher, "alice", "wonderland").await;
        assert_eq!(dispatcher.audit().len(), 1);

        let calls: Vec<ToolCall> = vec![
            ToolCall::CreateAdapter {
                kind: AdapterKind::Sql,
                config: json!({ "path": ":memory:" }),
            },
            execute_call("ghost", "query", json!({})),
            ToolCall::DestroyAdapter {
                instance: "ghost".to_string(),
            },
            ToolCall::Login {
                subject: "violet".to_string(),
                secret: "nope".to_string(),
            },
        ];

        let mut expected = 1;
        for call in calls {
            let _ = dispatcher.dispatch(Some(&token), call).await;
            expected += 1;
            assert_eq!(dispatcher.audit().len(), expected);
        }
    }
}
