//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    load_policies, IdentifierResolver, Policy, PolicyRegistry, Reaper,
    DEFAULT_CLEANUP_PROBABILITY, DEFAULT_TRUSTED_HEADERS,
};
use crate::store::{EventStore, MemoryEventStore, RedisEventStore, DEFAULT_KEY_PREFIX};

/// Prefix for environment overrides, e.g. `TOLLGATE__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Check service address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Admin server address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Where rate limit events are kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process; lost on restart and not shared between processes
    #[default]
    Memory,
    /// Redis sorted sets, shared by every process using the same prefix
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl StoreConfig {
    /// Open the configured store.
    pub async fn connect(&self) -> Result<Arc<dyn EventStore>> {
        match self {
            StoreConfig::Memory => {
                warn!("Using in-memory event store; limits reset on restart");
                Ok(Arc::new(MemoryEventStore::new()))
            }
            StoreConfig::Redis { url, key_prefix } => {
                Ok(Arc::new(RedisEventStore::connect(url, key_prefix).await?))
            }
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Event store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Chance that an admitted request triggers retention cleanup
    #[serde(default = "default_cleanup_probability")]
    pub cleanup_probability: f64,

    /// Interval of the timer-driven cleanup, off when unset
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    /// Proxy headers trusted for the client address, in precedence order
    #[serde(default = "default_trusted_headers")]
    pub trusted_headers: Vec<String>,

    /// Path to a YAML policy table, merged over `policies`
    #[serde(default)]
    pub policies_path: Option<String>,

    /// Inline policy table; empty means the built-in tiers
    #[serde(default)]
    pub policies: HashMap<String, Policy>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            cleanup_probability: default_cleanup_probability(),
            sweep_interval_secs: None,
            trusted_headers: default_trusted_headers(),
            policies_path: None,
            policies: HashMap::new(),
        }
    }
}

fn default_cleanup_probability() -> f64 {
    DEFAULT_CLEANUP_PROBABILITY
}

fn default_trusted_headers() -> Vec<String> {
    DEFAULT_TRUSTED_HEADERS.iter().map(|h| h.to_string()).collect()
}

impl RateLimitingConfig {
    /// Build the policy registry from the inline table and the policy file.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        let mut table = self.policies.clone();
        if let Some(path) = &self.policies_path {
            table.extend(load_policies(path)?);
        }

        if table.is_empty() {
            info!("No policies configured, using built-in tiers");
            return Ok(PolicyRegistry::with_default_tiers());
        }
        PolicyRegistry::new(table)
    }

    pub fn identifier_resolver(&self) -> Result<IdentifierResolver> {
        IdentifierResolver::new(self.trusted_headers.as_slice())
    }

    /// Interval of the timer sweep; zero counts as unset.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn reaper(&self) -> Result<Reaper> {
        if !(0.0..=1.0).contains(&self.cleanup_probability) {
            return Err(TollgateError::Config(format!(
                "cleanup_probability must be between 0 and 1, got {}",
                self.cleanup_probability
            )));
        }
        Ok(Reaper::new(self.cleanup_probability))
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig =
            serde_yaml::from_str(&contents).map_err(|e| TollgateError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply `TOLLGATE__*`
    /// environment overrides.
    ///
    /// Keys are read case-insensitively, so policy names come out lowercase;
    /// the policy registry treats action names the same way.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&str>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(Path::new(path)).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<TollgateConfig>())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tollgate-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();

        assert_eq!(config.server.http_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.server.admin_addr.to_string(), "127.0.0.1:8081");
        assert_eq!(config.rate_limiting.store, StoreConfig::Memory);
        assert_eq!(config.rate_limiting.cleanup_probability, 0.01);
        assert_eq!(config.rate_limiting.sweep_interval_secs, None);
        assert_eq!(config.rate_limiting.trusted_headers.len(), 3);
    }

    #[test]
    fn test_from_yaml() {
        let path = temp_file(
            "config.yaml",
            r#"
server:
  http_addr: "0.0.0.0:9000"
rate_limiting:
  store:
    type: redis
    url: "redis://127.0.0.1:6379"
  cleanup_probability: 0.05
  sweep_interval_secs: 300
  trusted_headers: ["x-real-ip"]
  policies:
    login:
      max_requests: 3
      window_seconds: 60
"#,
        );

        let config = TollgateConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.server.admin_addr.port(), 8081);
        assert_eq!(
            config.rate_limiting.store,
            StoreConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "tollgate".to_string(),
            }
        );
        assert_eq!(config.rate_limiting.sweep_interval_secs, Some(300));

        let registry = config.rate_limiting.policy_registry().unwrap();
        assert_eq!(registry.get("login").max_requests, 3);
        // the table has no default entry, so the built-in one is added
        assert_eq!(registry.get("default").max_requests, 30);
        assert!(!registry.contains("api"));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_empty_policies_use_builtin_tiers() {
        let registry = RateLimitingConfig::default().policy_registry().unwrap();
        assert_eq!(registry.get("auth").max_requests, 5);
        assert_eq!(registry.get("api_admin").max_requests, 2000);
    }

    #[test]
    fn test_policy_file_merges_over_inline() {
        let path = temp_file("policies.yaml", "login:\n  max_requests: 7\n  window_seconds: 120\n");

        let mut config = RateLimitingConfig::default();
        config.policies.insert("login".to_string(), Policy::new(3, 60).unwrap());
        config.policies.insert("upload".to_string(), Policy::new(2, 60).unwrap());
        config.policies_path = Some(path.to_str().unwrap().to_string());

        let registry = config.policy_registry().unwrap();
        assert_eq!(registry.get("login"), Policy::new(7, 120).unwrap());
        assert_eq!(registry.get("upload").max_requests, 2);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_invalid_inline_policy_is_rejected() {
        let mut config = RateLimitingConfig::default();
        config.policies.insert(
            "login".to_string(),
            Policy {
                max_requests: 0,
                window_seconds: 60,
            },
        );
        assert!(matches!(
            config.policy_registry(),
            Err(TollgateError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_zero_sweep_interval_is_off() {
        let mut config = RateLimitingConfig::default();
        assert_eq!(config.sweep_interval(), None);

        config.sweep_interval_secs = Some(0);
        assert_eq!(config.sweep_interval(), None);

        config.sweep_interval_secs = Some(300);
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_memory_store_connects() {
        let store = tokio_test::assert_ok!(StoreConfig::Memory.connect().await);
        assert!(store.statistics(0).await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_cleanup_probability() {
        let config = RateLimitingConfig {
            cleanup_probability: 1.5,
            ..Default::default()
        };
        assert!(config.reaper().is_err());
    }

    #[test]
    fn test_invalid_trusted_header() {
        let config = RateLimitingConfig {
            trusted_headers: vec!["not a header".to_string()],
            ..Default::default()
        };
        assert!(config.identifier_resolver().is_err());
    }

    #[test]
    fn test_load_layers_file_and_defaults() {
        let path = temp_file("layered.yaml", "server:\n  admin_addr: \"127.0.0.1:9901\"\n");

        let config = TollgateConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.server.admin_addr.port(), 9901);
        assert_eq!(config.server.http_addr.port(), 8080);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = temp_file("env.yaml", "rate_limiting:\n  cleanup_probability: 0.5\n");
        // a prefix of its own keeps these out of the other loader tests
        std::env::set_var("TOLLGATE_ENVTEST__SERVER__HTTP_ADDR", "0.0.0.0:9000");
        std::env::set_var("TOLLGATE_ENVTEST__RATE_LIMITING__CLEANUP_PROBABILITY", "0.05");

        let loaded = TollgateConfig::load_with_prefix(path.to_str(), "TOLLGATE_ENVTEST");

        std::env::remove_var("TOLLGATE_ENVTEST__SERVER__HTTP_ADDR");
        std::env::remove_var("TOLLGATE_ENVTEST__RATE_LIMITING__CLEANUP_PROBABILITY");
        std::fs::remove_file(path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.server.http_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.server.admin_addr.port(), 8081);
        assert_eq!(config.rate_limiting.cleanup_probability, 0.05);
    }

    #[test]
    fn test_mixed_case_policy_names_agree_across_loaders() {
        let path = temp_file(
            "mixed-case.yaml",
            r#"
rate_limiting:
  policies:
    Bulk_Export:
      max_requests: 2
      window_seconds: 600
"#,
        );
        let path = path.to_str().unwrap();

        let layered = TollgateConfig::load(Some(path)).unwrap();
        let plain = TollgateConfig::from_file(path).unwrap();

        for config in [layered, plain] {
            let registry = config.rate_limiting.policy_registry().unwrap();
            assert_eq!(registry.get("Bulk_Export"), Policy::new(2, 600).unwrap());
            assert_eq!(registry.get("bulk_export"), Policy::new(2, 600).unwrap());
            assert!(registry.list().contains_key("bulk_export"));
        }

        std::fs::remove_file(path).unwrap();
    }
}
