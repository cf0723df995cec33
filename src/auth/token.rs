//! Token store — issues, validates, and revokes signed bearer tokens.
//!
//! A bearer is `tg_<claims>.<sig>`: URL-safe base64 of the JSON claims
//! (subject, roles, iat, exp, jti) followed by an HMAC-SHA256 signature over
//! the claims bytes. The store keeps one [`TokenRecord`] per issued token,
//! keyed by JTI, and that map is the single source of truth for revocation:
//! `validate` re-derives validity on every call from the signed claims plus
//! the live record. Nothing else in the crate caches a validity verdict.
//!
//! A correctly signed token whose record is absent validates as revoked: the
//! store cannot vouch for a token it no longer holds.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{AuthFailure, Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Bearer prefix: greppable, detectable by secret scanners.
pub const TOKEN_PREFIX: &str = "tg_";

/// Signed claims carried inside a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Unique token identifier (used for revocation)
    pub jti: String,
    /// Subject the token was issued to
    pub sub: String,
    /// Roles granted at issuance
    pub roles: Vec<String>,
    /// Issued-at (Unix epoch seconds)
    pub iat: u64,
    /// Expires-at (Unix epoch seconds)
    pub exp: u64,
}

/// Live state held for every issued token.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    /// Token identifier (JTI)
    pub id: String,
    /// Subject the token belongs to
    pub subject: String,
    /// Issued-at (Unix epoch seconds)
    pub issued_at: u64,
    /// Expires-at (Unix epoch seconds)
    pub expires_at: u64,
    /// Set by revoke; checked on every validate
    pub revoked: bool,
}

impl TokenRecord {
    fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Returned by `issue` and `login`.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// The bearer value clients send back
    pub token: String,
    /// Token identifier (JTI)
    pub id: String,
    /// Subject the token was issued to
    pub subject: String,
    /// Roles granted at issuance
    pub roles: Vec<String>,
    /// Expires-at (Unix epoch seconds)
    pub expires_at: u64,
}

/// The authenticated identity a valid bearer resolves to.
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    /// Subject name (the audit actor)
    pub subject: String,
    /// Roles carried by the token
    pub roles: Vec<String>,
    /// Identifier of the validated token
    pub token_id: String,
}

struct RegisteredSubject {
    secret: String,
    roles: Vec<String>,
}

/// Issues, validates, and revokes bearer tokens.
///
/// Reads are lock-free (`DashMap`); writes touch single entries. Shared
/// across tasks behind an `Arc`.
pub struct TokenStore {
    mac_proto: HmacSha256,
    default_ttl: Duration,
    subjects: DashMap<String, RegisteredSubject>,
    records: DashMap<String, TokenRecord>,
}

impl TokenStore {
    /// Create a store signing with `secret`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the secret is empty.
    pub fn new(secret: &[u8], default_ttl: Duration) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("token signing secret is empty".to_string()));
        }
        let mac_proto = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::Config(format!("token signing secret rejected: {e}")))?;
        Ok(Self {
            mac_proto,
            default_ttl,
            subjects: DashMap::new(),
            records: DashMap::new(),
        })
    }

    /// Register a subject that may log in. Replaces any previous entry.
    pub fn register_subject(&self, name: &str, secret: &str, roles: Vec<String>) {
        self.subjects.insert(
            name.to_string(),
            RegisteredSubject {
                secret: secret.to_string(),
                roles,
            },
        );
    }

    /// Issue a token for `subject` carrying `roles`, valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Rejects an empty subject with `AuthFailure::UnknownSubject`.
    pub fn issue(&self, subject: &str, roles: &[String], ttl: Duration) -> Result<IssuedToken> {
        if subject.is_empty() {
            return Err(Error::Authentication(AuthFailure::UnknownSubject));
        }

        let now = now_epoch();
        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: subject.to_string(),
            roles: roles.to_vec(),
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
        };

        let payload = serde_json::to_vec(&claims)?;
        let sig = self.sign(&payload);
        let token = format!(
            "{TOKEN_PREFIX}{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        );

        self.records.insert(
            claims.jti.clone(),
            TokenRecord {
                id: claims.jti.clone(),
                subject: claims.sub.clone(),
                issued_at: claims.iat,
                expires_at: claims.exp,
                revoked: false,
            },
        );
        debug!(subject = %claims.sub, jti = %claims.jti, "Issued token");

        Ok(IssuedToken {
            token,
            id: claims.jti,
            subject: claims.sub,
            roles: claims.roles,
            expires_at: claims.exp,
        })
    }

    /// Check a subject's credential and issue a token with its configured
    /// roles and the default TTL.
    ///
    /// # Errors
    ///
    /// Unknown subjects and wrong secrets both fail with
    /// `AuthFailure::InvalidCredentials` so login cannot be used to probe
    /// for subject names.
    pub fn login(&self, subject: &str, secret: &str) -> Result<IssuedToken> {
        let Some(registered) = self.subjects.get(subject) else {
            return Err(Error::Authentication(AuthFailure::InvalidCredentials));
        };

        // Constant-time comparison to prevent timing side-channels
        let matches: bool = registered
            .secret
            .as_bytes()
            .ct_eq(secret.as_bytes())
            .into();
        if !matches {
            return Err(Error::Authentication(AuthFailure::InvalidCredentials));
        }

        let roles = registered.roles.clone();
        drop(registered);
        self.issue(subject, &roles, self.default_ttl)
    }

    /// Validate a bearer and resolve the identity it carries.
    ///
    /// Validity is re-derived on every call: signature, then expiry, then the
    /// live record. Both expiry and revocation are judged against state read
    /// before the decision (one clock read, one record lookup).
    ///
    /// # Errors
    ///
    /// `AuthFailure::Malformed` for structural or signature failures,
    /// `Expired` past the signed expiry (the record is purged lazily), and
    /// `Revoked` for revoked or unknown records.
    pub fn validate(&self, bearer: &str) -> Result<TokenIdentity> {
        let claims = self.decode(bearer)?;
        let now = now_epoch();

        if now >= claims.exp {
            // Lazy eviction: remove on access
            if self.records.remove(&claims.jti).is_some() {
                debug!(jti = %claims.jti, "Lazy-evicted expired token");
            }
            return Err(Error::Authentication(AuthFailure::Expired));
        }

        let revoked = match self.records.get(&claims.jti) {
            Some(record) => record.revoked,
            None => true,
        };
        if revoked {
            return Err(Error::Authentication(AuthFailure::Revoked));
        }

        Ok(TokenIdentity {
            subject: claims.sub,
            roles: claims.roles,
            token_id: claims.jti,
        })
    }

    /// Decode a bearer and return its signed claims without consulting the
    /// record store.
    ///
    /// For operational inspection (`toolgate token inspect`): the signature
    /// and structure are verified, but revocation state is per-process and is
    /// not reported here. [`TokenStore::validate`] remains the only
    /// authorization-relevant check.
    ///
    /// # Errors
    ///
    /// `AuthFailure::Malformed` if the bearer is not structurally valid or
    /// its signature does not verify.
    pub fn inspect(&self, bearer: &str) -> Result<Claims> {
        self.decode(bearer)
    }

    /// Revoke a bearer. Takes effect immediately; the record stays until its
    /// expiry passes so `validate` reports `Revoked` rather than unknown.
    ///
    /// Revoking an already-revoked or unknown token is a no-op. Returns the
    /// token id for the audit trail.
    ///
    /// # Errors
    ///
    /// `AuthFailure::Malformed` if the bearer is not structurally valid.
    pub fn revoke(&self, bearer: &str) -> Result<String> {
        let claims = self.decode(bearer)?;
        if let Some(mut record) = self.records.get_mut(&claims.jti) {
            record.revoked = true;
            debug!(jti = %claims.jti, "Revoked token");
        }
        Ok(claims.jti)
    }

    /// Revoke all live tokens of a subject (e.g. on offboarding).
    /// Returns the number of records newly revoked.
    pub fn revoke_subject(&self, subject: &str) -> usize {
        let mut revoked = 0;
        for mut entry in self.records.iter_mut() {
            if entry.subject == subject && !entry.revoked {
                entry.revoked = true;
                revoked += 1;
            }
        }
        if revoked > 0 {
            debug!(subject, count = revoked, "Revoked all tokens for subject");
        }
        revoked
    }

    /// Remove expired records. Called periodically by the background reaper;
    /// correctness never depends on it (expiry is judged from the signed
    /// claims), it only bounds memory.
    pub fn purge_expired(&self) -> usize {
        let now = now_epoch();
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len();
        for jti in expired {
            if self.records.remove(&jti).is_some() {
                debug!(%jti, "Reaped expired token");
            }
        }
        count
    }

    /// Number of live (unexpired, unrevoked) records.
    #[must_use]
    pub fn active_tokens(&self) -> usize {
        let now = now_epoch();
        self.records
            .iter()
            .filter(|e| !e.revoked && !e.is_expired_at(now))
            .count()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac_proto.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Decode and verify a bearer. Every structural failure maps to
    /// `Malformed`; messages never include the bearer itself.
    fn decode(&self, bearer: &str) -> Result<Claims> {
        let malformed = || Error::Authentication(AuthFailure::Malformed);

        let rest = bearer.strip_prefix(TOKEN_PREFIX).ok_or_else(malformed)?;
        let (claims_b64, sig_b64) = rest.split_once('.').ok_or_else(malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| malformed())?;
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| malformed())?;

        let mut mac = self.mac_proto.clone();
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| malformed())?;

        serde_json::from_slice(&payload).map_err(|_| malformed())
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Spawn a background task that purges expired records every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<TokenStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.purge_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired tokens");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Token reaper shutting down");
                    break;
                }
            }
        }
    });
}
