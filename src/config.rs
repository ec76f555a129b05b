//! Configuration management for Ratekeeper.
//!
//! Service settings come from an optional YAML file layered under
//! `RATEKEEPER__SECTION__FIELD` environment variables. Rate limit rules live in
//! their own file, referenced by `admission.rules_path`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{RatekeeperError, Result};
use crate::transport::DEFAULT_MAX_LINE_LENGTH;
use crate::ratelimit::{
    AdmissionEngine, DuplicatePolicy, EngineOptions, FailureMode, MemoryStore, RuleSet, RulesFile,
    SystemClock, DEFAULT_STORE_CAPACITY,
};

const ENV_PREFIX: &str = "RATEKEEPER";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission engine configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the admission service listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Longest request line a TCP client may send, in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Optional address for the HTTP admission middleware
    #[serde(default)]
    pub http_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_line_length: default_max_line_length(),
            http_addr: None,
        }
    }
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Admission engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Number of lock shards guarding quota updates
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,

    /// Behavior when the quota store fails
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Handling of rules sharing a domain and descriptor set
    #[serde(default)]
    pub duplicate_rules: DuplicatePolicy,

    /// Maximum number of quota records held in memory
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            lock_shards: default_lock_shards(),
            failure_mode: FailureMode::default(),
            duplicate_rules: DuplicatePolicy::default(),
            store_capacity: default_store_capacity(),
        }
    }
}

fn default_lock_shards() -> usize {
    1
}

fn default_store_capacity() -> usize {
    DEFAULT_STORE_CAPACITY
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Filter directives used when `RUST_LOG` is unset
    #[serde(default)]
    pub filter: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration, reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading service configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<ServiceConfig>())
            .map_err(|e| RatekeeperError::Config(e.to_string()))
    }
}

impl AdmissionConfig {
    /// Engine options derived from this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            lock_shards: self.lock_shards,
            failure_mode: self.failure_mode,
        }
    }

    /// Load and index the configured rules.
    ///
    /// Without a rules path every identity is unlimited.
    pub fn load_rules(&self) -> Result<RuleSet> {
        let Some(path) = &self.rules_path else {
            warn!("No rules file configured, all requests will be admitted");
            return Ok(RuleSet::default());
        };

        let file = RulesFile::from_file(path)?;
        let rules = RuleSet::with_policy(file.rate_limits, self.duplicate_rules)?;
        info!(path = %path.display(), rules = rules.len(), "Rate limit rules loaded");
        Ok(rules)
    }

    /// Build an engine backed by the in-memory store.
    pub fn build_engine(&self) -> Result<AdmissionEngine<MemoryStore>> {
        if self.lock_shards == 0 {
            return Err(RatekeeperError::Config(
                "admission.lock_shards must be at least 1".to_string(),
            ));
        }

        let rules = self.load_rules()?;
        let store = MemoryStore::with_capacity(self.store_capacity);
        Ok(AdmissionEngine::with_options(
            rules,
            store,
            Arc::new(SystemClock::new()),
            self.engine_options(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::load_with_env(None, Some(HashMap::new())).unwrap();

        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.server.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert!(config.server.http_addr.is_none());
        assert_eq!(config.admission.lock_shards, 1);
        assert_eq!(config.admission.failure_mode, FailureMode::Open);
        assert_eq!(config.admission.duplicate_rules, DuplicatePolicy::LastWins);
        assert_eq!(config.admission.store_capacity, DEFAULT_STORE_CAPACITY);
        assert!(config.admission.rules_path.is_none());
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "ratekeeper.yaml",
            r#"
server:
  listen_addr: "0.0.0.0:9000"
  max_line_length: 4096
  http_addr: "0.0.0.0:9080"
admission:
  rules_path: /etc/ratekeeper/rules.yaml
  lock_shards: 8
  failure_mode: closed
  duplicate_rules: reject
logging:
  json: true
"#,
        );

        let config = ServiceConfig::load_with_env(Some(&path), Some(HashMap::new())).unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.server.max_line_length, 4096);
        assert_eq!(config.server.http_addr, Some("0.0.0.0:9080".parse().unwrap()));
        assert_eq!(config.admission.lock_shards, 8);
        assert_eq!(config.admission.failure_mode, FailureMode::Closed);
        assert_eq!(config.admission.duplicate_rules, DuplicatePolicy::Reject);
        assert_eq!(
            config.admission.rules_path,
            Some(PathBuf::from("/etc/ratekeeper/rules.yaml"))
        );
        assert!(config.logging.json);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "ratekeeper.yaml", "admission:\n  lock_shards: 8\n");

        let mut env = HashMap::new();
        env.insert("RATEKEEPER__ADMISSION__LOCK_SHARDS".to_string(), "32".to_string());

        let config = ServiceConfig::load_with_env(Some(&path), Some(env)).unwrap();
        assert_eq!(config.admission.lock_shards, 32);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let result = ServiceConfig::load_with_env(
            Some(Path::new("/nonexistent/ratekeeper.yaml")),
            Some(HashMap::new()),
        );
        assert!(matches!(result, Err(RatekeeperError::Config(_))));
    }

    #[test]
    fn test_build_engine_from_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = write_file(
            &dir,
            "rules.yaml",
            r#"
rate_limits:
  - domain: checkout
    descriptors:
      tier: free
    rate_limit:
      unit: minute
      requests_per_unit: 2
"#,
        );
        let admission = AdmissionConfig {
            rules_path: Some(rules_path),
            lock_shards: 4,
            ..Default::default()
        };

        let engine = admission.build_engine().unwrap();
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.lock_shards(), 4);

        assert!(engine.allow("checkout", [("tier", "free")]).unwrap());
        assert!(engine.allow("checkout", [("tier", "free")]).unwrap());
        assert!(!engine.allow("checkout", [("tier", "free")]).unwrap());
    }

    #[test]
    fn test_build_engine_rejects_duplicates_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let rules_path = write_file(
            &dir,
            "rules.yaml",
            r#"
rate_limits:
  - domain: checkout
    rate_limit: { unit: minute, requests_per_unit: 2 }
  - domain: checkout
    rate_limit: { unit: hour, requests_per_unit: 5 }
"#,
        );
        let admission = AdmissionConfig {
            rules_path: Some(rules_path),
            duplicate_rules: DuplicatePolicy::Reject,
            ..Default::default()
        };

        assert!(matches!(
            admission.build_engine(),
            Err(RatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_build_engine_zero_shards_rejected() {
        let admission = AdmissionConfig {
            lock_shards: 0,
            ..Default::default()
        };
        assert!(matches!(
            admission.build_engine(),
            Err(RatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_build_engine_without_rules_admits_everything() {
        let engine = AdmissionConfig::default().build_engine().unwrap();
        assert!(engine.rules().is_empty());
        assert!(engine.allow("anything", [("k", "v")]).unwrap());
    }
}
