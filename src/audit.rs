//! Audit trail — an append-only record of every dispatched call.
//!
//! Events are serialized as JSON lines and appended through an [`AuditSink`].
//! Sequence numbers are assigned under one lock, so the order of sequence
//! numbers is the order of submission. A bounded in-memory ring keeps the most
//! recent events for inspection and absorbs sink write failures: a failing
//! sink degrades the trail, it never fails the audited call.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.login` | A subject exchanged credentials for a token |
//! | `auth.login_failure` | Credential exchange was rejected |
//! | `auth.revoke` | A token was revoked |
//! | `authz.denied` | A valid token lacked permission for an operation |
//! | `adapter.create` | An adapter instance was created (or rejected) |
//! | `adapter.execute` | An adapter instance served (or failed) a call |
//! | `adapter.read` | Instance metadata or the instance list was read |
//! | `adapter.destroy` | An adapter instance was destroyed |
//! | `dispatch.abort` | A dispatch was cancelled before completing |

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::{Error, Result};

/// Outcome of the audited call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The call completed
    Success,
    /// The call failed or was denied
    Failure,
}

/// Structured audit event. Exactly one is recorded per dispatched call.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Sequence number in submission order; assigned by [`AuditLog::record`]
    pub seq: u64,
    /// Event creation time
    pub ts: DateTime<Utc>,
    /// Event type string (e.g. `"adapter.execute"`)
    pub event: &'static str,
    /// Acting subject (`"-"` when no identity was established)
    pub actor: String,
    /// Success or failure
    pub outcome: AuditOutcome,
    /// Event-specific fields
    pub context: Map<String, Value>,
}

impl AuditEvent {
    fn base(event: &'static str, actor: &str, outcome: AuditOutcome) -> Self {
        Self {
            seq: 0,
            ts: Utc::now(),
            event,
            actor: actor.to_string(),
            outcome,
            context: Map::new(),
        }
    }

    /// Construct an `auth.login` success event.
    #[must_use]
    pub fn login(actor: &str) -> Self {
        Self::base("auth.login", actor, AuditOutcome::Success)
    }

    /// Construct an `auth.login_failure` event.
    #[must_use]
    pub fn login_failure(actor: &str, reason: &str) -> Self {
        Self::base("auth.login_failure", actor, AuditOutcome::Failure)
            .with("error", json!(reason))
    }

    /// Construct an `auth.revoke` event.
    #[must_use]
    pub fn revoked(actor: &str) -> Self {
        Self::base("auth.revoke", actor, AuditOutcome::Success)
    }

    /// Construct an `authz.denied` event.
    #[must_use]
    pub fn authz_denied(actor: &str, operation: &str, roles: &[String]) -> Self {
        Self::base("authz.denied", actor, AuditOutcome::Failure)
            .with("operation", json!(operation))
            .with("roles", json!(roles))
    }

    /// Construct an `adapter.create` success event.
    #[must_use]
    pub fn adapter_create(actor: &str, kind: &str, instance: &str) -> Self {
        Self::base("adapter.create", actor, AuditOutcome::Success)
            .with("kind", json!(kind))
            .with("instance", json!(instance))
    }

    /// Construct an `adapter.execute` success event.
    #[must_use]
    pub fn adapter_execute(actor: &str, instance: &str, operation: &str) -> Self {
        Self::base("adapter.execute", actor, AuditOutcome::Success)
            .with("instance", json!(instance))
            .with("operation", json!(operation))
    }

    /// Construct an `adapter.read` success event (`"-"` for a list read).
    #[must_use]
    pub fn adapter_read(actor: &str, instance: &str) -> Self {
        Self::base("adapter.read", actor, AuditOutcome::Success)
            .with("instance", json!(instance))
    }

    /// Construct an `adapter.destroy` success event.
    #[must_use]
    pub fn adapter_destroy(actor: &str, instance: &str) -> Self {
        Self::base("adapter.destroy", actor, AuditOutcome::Success)
            .with("instance", json!(instance))
    }

    /// Construct a `dispatch.abort` event for a cancelled call.
    #[must_use]
    pub fn aborted(actor: &str, operation: &str) -> Self {
        Self::base("dispatch.abort", actor, AuditOutcome::Failure)
            .with("operation", json!(operation))
    }

    /// Add a context field.
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Mark the event failed and record the reason.
    #[must_use]
    pub fn failed(mut self, reason: &str) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.context.insert("error".to_string(), json!(reason));
        self
    }
}

/// Destination for serialized audit lines.
pub trait AuditSink: Send {
    /// Append one serialized event.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuditWrite` when the line could not be persisted; the
    /// caller keeps the event in the fallback ring.
    fn append(&mut self, line: &str) -> Result<()>;
}

/// Emits audit lines through `tracing::info!` with a structured `audit`
/// field, queryable by any log aggregator.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn append(&mut self, line: &str) -> Result<()> {
        tracing::info!(audit = %line, "audit");
        Ok(())
    }
}

/// Appends line-delimited JSON to a file, flushing per event.
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Open (or create) the audit file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileSink {
    fn append(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}").map_err(|e| Error::AuditWrite(e.to_string()))?;
        self.file
            .flush()
            .map_err(|e| Error::AuditWrite(e.to_string()))
    }
}

struct Inner {
    seq: u64,
    sink: Box<dyn AuditSink>,
    ring: VecDeque<AuditEvent>,
    ring_capacity: usize,
    dropped_writes: u64,
}

/// The append-only audit log.
///
/// All appends go through one mutex: sequence assignment and the sink write
/// happen under it, so sequence order is submission order. `record` never
/// fails; a failing sink raises a `tracing::warn!` and the event stays in
/// the ring.
pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Create a log writing to `sink`, keeping `ring_capacity` recent events.
    #[must_use]
    pub fn new(sink: Box<dyn AuditSink>, ring_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seq: 0,
                sink,
                ring: VecDeque::with_capacity(ring_capacity.min(1024)),
                ring_capacity: ring_capacity.max(1),
                dropped_writes: 0,
            }),
        }
    }

    /// Create a log emitting through the tracing subscriber.
    #[must_use]
    pub fn tracing(ring_capacity: usize) -> Self {
        Self::new(Box::new(TracingSink), ring_capacity)
    }

    /// Append an event. Returns its sequence number.
    pub fn record(&self, mut event: AuditEvent) -> u64 {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        event.seq = inner.seq;

        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = inner.sink.append(&line) {
                    inner.dropped_writes += 1;
                    tracing::warn!(
                        error = %e,
                        seq = event.seq,
                        "Audit sink write failed; event retained in memory ring"
                    );
                }
            }
            Err(e) => {
                inner.dropped_writes += 1;
                tracing::warn!(error = %e, "Failed to serialize audit event");
            }
        }

        if inner.ring.len() == inner.ring_capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event);
        inner.seq
    }

    /// Snapshot of the most recent `n` events, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        let inner = self.inner.lock();
        let len = inner.ring.len();
        inner.ring.iter().skip(len.saturating_sub(n)).cloned().collect()
    }

    /// Total number of events recorded so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Whether no event has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events whose sink write failed (they remain in the ring).
    #[must_use]
    pub fn dropped_writes(&self) -> u64 {
        self.inner.lock().dropped_writes
    }
}
