//! Configuration management for Windowguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WindowguardError};
use crate::ratelimit::{GraphQLEndpoint, LimitOverride};

/// Prefix of environment variables overriding file configuration,
/// e.g. `WINDOWGUARD__LIMIT=500`.
pub const ENV_PREFIX: &str = "WINDOWGUARD";

/// Main configuration for the rate limiting engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default hits allowed per window
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Default window length in seconds
    #[serde(default = "default_period")]
    pub period: i64,

    /// Give each of `limited_routes` its own counter and limits. When false
    /// they all share one counter under the default limit and period.
    #[serde(default)]
    pub limit_by_route: bool,

    /// Expose counters in response headers and in the 429 body
    #[serde(default)]
    pub display_headers: bool,

    /// Routes limited on their own counter, with optional overrides
    #[serde(default)]
    pub routes: HashMap<String, LimitOverride>,

    /// Routes whose handlers are marked as rate limited, with the limit and
    /// period declared on the handler. Governed by `limit_by_route`.
    #[serde(default)]
    pub limited_routes: HashMap<String, LimitOverride>,

    /// Per-GraphQL-operation limits
    #[serde(default)]
    pub graphql_endpoints: Vec<GraphQLEndpoint>,

    /// Request attributes to vary on, after the HTTP method
    #[serde(default)]
    pub attribute_modifiers: Vec<String>,

    /// Upper bound on each storage call, in milliseconds
    #[serde(default)]
    pub storage_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            period: default_period(),
            limit_by_route: false,
            display_headers: false,
            routes: HashMap::new(),
            limited_routes: HashMap::new(),
            graphql_endpoints: Vec::new(),
            attribute_modifiers: Vec::new(),
            storage_timeout_ms: None,
        }
    }
}

fn default_limit() -> i64 {
    1000
}

fn default_period() -> i64 {
    60
}

impl EngineConfig {
    /// Load configuration from a YAML file, overridden by `WINDOWGUARD__*`
    /// environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WindowguardError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject negative limits and periods anywhere in the tree.
    pub fn validate(&self) -> Result<()> {
        check("limit", self.limit)?;
        check("period", self.period)?;

        for (table, routes) in [("routes", &self.routes), ("limited_routes", &self.limited_routes)] {
            for (route, overrides) in routes {
                if let Some(limit) = overrides.limit {
                    check(&format!("{}.{}.limit", table, route), limit)?;
                }
                if let Some(period) = overrides.period {
                    check(&format!("{}.{}.period", table, route), period)?;
                }
            }
        }

        for endpoint in &self.graphql_endpoints {
            if let Some(limit) = endpoint.limit {
                check(&format!("graphql_endpoints.{}.limit", endpoint.endpoint), limit)?;
            }
            if let Some(period) = endpoint.period {
                check(&format!("graphql_endpoints.{}.period", endpoint.endpoint), period)?;
            }
        }

        Ok(())
    }

    /// Storage timeout as a `Duration`, if configured.
    pub fn storage_timeout(&self) -> Option<Duration> {
        self.storage_timeout_ms.map(Duration::from_millis)
    }
}

fn check(name: &str, value: i64) -> Result<()> {
    if value < 0 {
        return Err(WindowguardError::Config(format!(
            "{} must be >= 0, got {}",
            name, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limit, 1000);
        assert_eq!(config.period, 60);
        assert!(!config.limit_by_route);
        assert!(!config.display_headers);
        assert!(config.storage_timeout().is_none());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
limit: 100
period: 10
limit_by_route: true
display_headers: true
storage_timeout_ms: 250
routes:
  api_list:
    limit: 5
    period: 1
  api_show:
    period: 30
limited_routes:
  order_export:
    limit: 1
  order_import: {}
graphql_endpoints:
  - endpoint: createOrder
    limit: 2
attribute_modifiers:
  - tenant
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limit, 100);
        assert!(config.display_headers);
        assert_eq!(config.routes["api_list"].limit, Some(5));
        assert_eq!(config.routes["api_show"].limit, None);
        assert_eq!(config.limited_routes["order_export"].limit, Some(1));
        assert_eq!(config.limited_routes["order_import"], LimitOverride::default());
        assert_eq!(config.graphql_endpoints[0].endpoint, "createOrder");
        assert_eq!(config.attribute_modifiers, vec!["tenant".to_string()]);
        assert_eq!(config.storage_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_negative_values_rejected() {
        assert!(matches!(
            EngineConfig::from_yaml("limit: -1"),
            Err(WindowguardError::Config(_))
        ));
        assert!(EngineConfig::from_yaml("routes:\n  r:\n    period: -5").is_err());
        assert!(EngineConfig::from_yaml("limited_routes:\n  r:\n    limit: -1").is_err());
        assert!(EngineConfig::from_yaml("graphql_endpoints:\n  - endpoint: q\n    limit: -2").is_err());
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(matches!(
            EngineConfig::from_yaml("limit: [not, a, number]"),
            Err(WindowguardError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("windowguard-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "limit: 42\nroutes:\n  api_list:\n    limit: 3\n").unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        let parsed = EngineConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.limit, 42);
        assert_eq!(loaded.routes["api_list"].limit, Some(3));
        assert_eq!(parsed.limit, 42);
    }
}
