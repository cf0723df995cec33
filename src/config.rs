//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Token issuance and validation
    pub auth: AuthConfig,
    /// Role to operation permissions
    pub authz: AuthzConfig,
    /// Response cache
    pub cache: CacheConfig,
    /// Audit trail
    pub audit: AuditConfig,
    /// Adapter instances created at startup (owner `system`)
    pub adapters: HashMap<String, AdapterSeed>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TOOLGATE_ prefix)
        figment = figment.merge(Env::prefixed("TOOLGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();

        // Expand ${VAR} in adapter header values
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in adapter header values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for seed in self.adapters.values_mut() {
            let Some(headers) = seed
                .config
                .get_mut("headers")
                .and_then(serde_json::Value::as_object_mut)
            else {
                continue;
            };
            for value in headers.values_mut() {
                if let Some(s) = value.as_str() {
                    *value = serde_json::Value::String(Self::expand_string(&re, s));
                }
            }
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Validate the loaded configuration before any component is built
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let secret = self.auth.resolve_secret();
        if secret.is_empty() {
            return Err(Error::Config(
                "auth.token_secret is required (literal or env:VAR)".to_string(),
            ));
        }
        if secret.len() < 16 {
            return Err(Error::Config(
                "auth.token_secret must be at least 16 bytes".to_string(),
            ));
        }

        for subject in &self.auth.subjects {
            if subject.name.is_empty() {
                return Err(Error::Config("auth.subjects: empty subject name".to_string()));
            }
            if subject.resolve_secret().is_empty() {
                return Err(Error::Config(format!(
                    "auth.subjects.{}: secret is required",
                    subject.name
                )));
            }
        }

        for (role, patterns) in &self.authz.roles {
            if role.is_empty() {
                return Err(Error::Config("authz.roles: empty role name".to_string()));
            }
            if patterns.is_empty() {
                return Err(Error::Config(format!(
                    "authz.roles.{role}: permission list is empty"
                )));
            }
        }

        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be > 0".to_string()));
        }

        if self.audit.sink == AuditSinkKind::File && self.audit.path.is_none() {
            return Err(Error::Config(
                "audit.path is required when audit.sink is 'file'".to_string(),
            ));
        }

        for (name, seed) in &self.adapters {
            if !seed.config.is_object() {
                return Err(Error::Config(format!(
                    "adapters.{name}.config must be a mapping"
                )));
            }
        }

        Ok(())
    }
}

/// Token issuance and validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC signing secret for issued tokens.
    /// Supports a literal value or `env:VAR_NAME` indirection.
    pub token_secret: String,

    /// Lifetime of issued tokens
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,

    /// Interval for the expired-record reaper task
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,

    /// Registered subjects that may log in
    #[serde(default)]
    pub subjects: Vec<SubjectConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            token_ttl: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(300),
            subjects: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Resolve the signing secret (expand `env:VAR_NAME` indirection).
    /// An unset variable resolves to empty, which `validate` rejects.
    #[must_use]
    pub fn resolve_secret(&self) -> String {
        resolve_env_ref(&self.token_secret)
    }
}

/// A subject registered for login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectConfig {
    /// Subject name (the audit actor)
    pub name: String,
    /// Login secret (supports `env:VAR_NAME`)
    pub secret: String,
    /// Roles granted to tokens issued for this subject
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SubjectConfig {
    /// Resolve the login secret (expand `env:VAR_NAME` indirection)
    #[must_use]
    pub fn resolve_secret(&self) -> String {
        resolve_env_ref(&self.secret)
    }
}

/// Expand `env:VAR_NAME` indirection used by secret-bearing values.
/// An unset variable resolves to empty; literals pass through unchanged.
#[must_use]
pub fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// Authorization configuration: role to permitted operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Operations that require no token (default: `["auth.login"]`)
    #[serde(default = "default_public_operations")]
    pub public: Vec<String>,

    /// Role name to permitted operation patterns.
    /// Patterns are exact names or trailing-`*` globs (`adapter.*`).
    #[serde(default = "default_roles")]
    pub roles: HashMap<String, Vec<String>>,
}

fn default_public_operations() -> Vec<String> {
    vec!["auth.login".to_string()]
}

/// Built-in role table: `admin` holds everything, `operator` manages and runs
/// adapters, `viewer` only reads.
#[must_use]
pub fn default_roles() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("admin".to_string(), vec!["*".to_string()]),
        (
            "operator".to_string(),
            vec![
                "adapter.create".to_string(),
                "adapter.execute".to_string(),
                "adapter.destroy".to_string(),
                "adapter.read".to_string(),
            ],
        ),
        ("viewer".to_string(), vec!["adapter.read".to_string()]),
    ])
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            public: default_public_operations(),
            roles: default_roles(),
        }
    }
}

/// Cache configuration for response caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching
    pub enabled: bool,
    /// Default TTL for cached responses
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Maximum number of entries before eviction
    pub max_entries: usize,
    /// Scope cache keys to the authenticated actor. Leave on unless every
    /// cached response is known to be identical across actors.
    pub per_actor: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(60),
            max_entries: 10_000,
            per_actor: true,
        }
    }
}

/// Audit sink selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    /// Emit audit events through the tracing subscriber
    Tracing,
    /// Append line-delimited JSON to a file
    File,
}

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Where audit events are written
    pub sink: AuditSinkKind,
    /// File path (required for the file sink)
    pub path: Option<String>,
    /// Capacity of the in-memory ring that absorbs sink failures and
    /// serves `recent()`
    pub ring_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::Tracing,
            path: None,
            ring_capacity: 256,
        }
    }
}

/// An adapter instance declared in configuration, created at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSeed {
    /// Adapter kind tag (`rest` or `sql`)
    pub kind: String,
    /// Kind-specific configuration object
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "100ms", "30s", "5m", "1h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s}")))
    }

    /// Parse a human-readable duration string ("100ms", "30s", "5m", "1h",
    /// bare number = seconds)
    #[must_use]
    pub fn parse_duration(s: &str) -> Option<Duration> {
        // "ms" before "s": both end in 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().ok().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "TOOLGATE_TEST_KEY_A=hello_from_env_file").unwrap();
        writeln!(f, "TOOLGATE_TEST_KEY_B=42").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("TOOLGATE_TEST_KEY_A").unwrap(),
            "hello_from_env_file"
        );
        assert_eq!(env::var("TOOLGATE_TEST_KEY_B").unwrap(), "42");

        // Note: env::remove_var is unsafe in edition 2024 and lib forbids unsafe.
        // Test keys use unique TOOLGATE_TEST_ prefix so won't conflict.
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        // Should not panic
        config.load_env_files();
    }

    #[test]
    fn test_config_deserialized_from_yaml() {
        let yaml = r#"
auth:
  token_secret: "0123456789abcdef0123456789abcdef"
  token_ttl: 2h
  subjects:
    - name: admin
      secret: env:TOOLGATE_ADMIN_SECRET
      roles: [admin]
cache:
  default_ttl: 30s
  per_actor: false
adapters:
  reports:
    kind: rest
    config:
      base_url: "https://reports.internal"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.auth.token_ttl, Duration::from_secs(7200));
        assert_eq!(config.auth.subjects.len(), 1);
        assert_eq!(config.auth.subjects[0].roles, vec!["admin"]);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(30));
        assert!(!config.cache.per_actor);
        assert_eq!(config.adapters["reports"].kind, "rest");
        config.validate().unwrap();
    }

    #[test]
    fn test_duration_suffixes() {
        #[derive(Deserialize)]
        struct D {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let parse = |s: &str| serde_yaml::from_str::<D>(&format!("d: {s}")).unwrap().d;
        assert_eq!(parse("100ms"), Duration::from_millis(100));
        assert_eq!(parse("45s"), Duration::from_secs(45));
        assert_eq!(parse("5m"), Duration::from_secs(300));
        assert_eq!(parse("1h"), Duration::from_secs(3600));
        assert_eq!(parse("90"), Duration::from_secs(90));
    }

    #[test]
    fn test_validate_rejects_missing_secret() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token_secret"));
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let config = Config {
            auth: AuthConfig {
                token_secret: "short".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_file_sink_without_path() {
        let config = Config {
            auth: AuthConfig {
                token_secret: "0123456789abcdef0123456789abcdef".to_string(),
                ..Default::default()
            },
            audit: AuditConfig {
                sink: AuditSinkKind::File,
                path: None,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("audit.path"));
    }

    #[test]
    fn test_default_roles_cover_builtins() {
        let roles = default_roles();
        assert_eq!(roles["admin"], vec!["*"]);
        assert!(roles["operator"].iter().any(|p| p == "adapter.create"));
        assert!(roles["viewer"].iter().all(|p| !p.contains("create")));
    }

    #[test]
    fn test_env_ref_resolution() {
        let subject = SubjectConfig {
            name: "svc".to_string(),
            secret: "env:TOOLGATE_TEST_SVC_SECRET_UNSET".to_string(),
            roles: vec![],
        };
        // Unset variable resolves to empty (validate rejects it later)
        assert_eq!(subject.resolve_secret(), "");

        let literal = SubjectConfig {
            name: "svc".to_string(),
            secret: "s3cr3t".to_string(),
            roles: vec![],
        };
        assert_eq!(literal.resolve_secret(), "s3cr3t");
    }

    #[test]
    fn test_header_env_expansion() {
        let yaml = r#"
adapters:
  api:
    kind: rest
    config:
      base_url: "https://api.internal"
      headers:
        Authorization: "Bearer ${TOOLGATE_TEST_EXPAND_UNSET:-fallback}"
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.expand_env_vars();
        let headers = &config.adapters["api"].config["headers"];
        assert_eq!(headers["Authorization"], "Bearer fallback");
    }
}
