//! Configuration management for the limiter.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{HeaderMapping, LimitSpec, RetryAfterFormat, Strategy};
use crate::scope::ExemptionScope;

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "RATELIMIT";

/// Main configuration for the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Master switch. A disabled limiter allows every request.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix of every storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Windowing strategy of the in-memory backends
    #[serde(default)]
    pub strategy: Strategy,

    /// Stop evaluating at the first breached limit
    #[serde(default = "default_true")]
    pub fail_on_first_breach: bool,

    /// Log and ignore backend and callback errors
    #[serde(default)]
    pub swallow_errors: bool,

    /// Limits applied to every route without limits of its own
    #[serde(default)]
    pub default_limits: Vec<String>,

    #[serde(default)]
    pub default_limits_per_method: bool,

    #[serde(default = "default_cost")]
    pub default_limits_cost: u32,

    /// Limits shared by every route of the application
    #[serde(default)]
    pub application_limits: Vec<String>,

    #[serde(default)]
    pub application_limits_per_method: bool,

    #[serde(default = "default_cost")]
    pub application_limits_cost: u32,

    /// Limits on how often an identity may breach other limits
    #[serde(default)]
    pub meta_limits: Vec<String>,

    /// Write rate limit headers on responses
    #[serde(default)]
    pub headers_enabled: bool,

    #[serde(default)]
    pub header_mapping: HeaderMapping,

    #[serde(default)]
    pub retry_after: RetryAfterFormat,

    /// Limits used instead of the configured ones while the backend is down
    #[serde(default)]
    pub in_memory_fallback: Vec<String>,

    /// Switch to an in-memory backend while the primary one is down
    #[serde(default)]
    pub in_memory_fallback_enabled: bool,

    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: default_key_prefix(),
            strategy: Strategy::default(),
            fail_on_first_breach: true,
            swallow_errors: false,
            default_limits: Vec::new(),
            default_limits_per_method: false,
            default_limits_cost: default_cost(),
            application_limits: Vec::new(),
            application_limits_per_method: false,
            application_limits_cost: default_cost(),
            meta_limits: Vec::new(),
            headers_enabled: false,
            header_mapping: HeaderMapping::default(),
            retry_after: RetryAfterFormat::default(),
            in_memory_fallback: Vec::new(),
            in_memory_fallback_enabled: false,
            namespaces: Vec::new(),
            routes: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "LIMITER".to_string()
}

fn default_cost() -> u32 {
    1
}

/// A limit in configuration: either a bare expression or a detailed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitEntry {
    Expression(String),
    Detailed(LimitConfig),
}

/// Detailed limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    pub limit: String,

    #[serde(default)]
    pub methods: Option<Vec<String>>,

    #[serde(default)]
    pub per_method: bool,

    #[serde(default = "default_cost")]
    pub cost: u32,

    #[serde(default = "default_true")]
    pub override_defaults: bool,

    /// Scope combined with the route
    #[serde(default)]
    pub scope: Option<String>,

    /// Scope shared between every route carrying it
    #[serde(default)]
    pub shared_scope: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,
}

impl LimitEntry {
    pub fn to_spec(&self) -> LimitSpec {
        match self {
            LimitEntry::Expression(expression) => LimitSpec::new(expression.as_str()),
            LimitEntry::Detailed(config) => {
                let mut spec = LimitSpec::new(config.limit.as_str())
                    .per_method(config.per_method)
                    .cost(config.cost)
                    .override_defaults(config.override_defaults);
                if let Some(methods) = &config.methods {
                    spec = spec.methods(methods);
                }
                if let Some(scope) = &config.scope {
                    spec = spec.scope(scope.as_str());
                }
                if let Some(shared) = &config.shared_scope {
                    spec = spec.shared(shared.as_str());
                }
                if let Some(message) = &config.error_message {
                    spec = spec.error_message(message.as_str());
                }
                spec
            }
        }
    }
}

/// A namespace declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,

    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub limits: Vec<LimitEntry>,

    /// Exemption flags, e.g. `[default, application, meta]`
    #[serde(default)]
    pub exempt: Option<ExemptionScope>,
}

/// A route declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Namespaces from the root down to the one owning the route
    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(default)]
    pub limits: Vec<LimitEntry>,

    #[serde(default)]
    pub exempt: Option<ExemptionScope>,
}

fn specs(expressions: &[String], per_method: bool, cost: u32) -> Vec<LimitSpec> {
    expressions
        .iter()
        .map(|expression| {
            LimitSpec::new(expression.as_str())
                .per_method(per_method)
                .cost(cost)
        })
        .collect()
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            LimiterError::Configuration(format!("Failed to parse limiter config: {}", e))
        })
    }

    /// Load an optional file and apply `RATELIMIT_*` environment overrides.
    ///
    /// Nested keys use `__`, list values are comma separated, e.g.
    /// `RATELIMIT_DEFAULT_LIMITS="200/day,50/hour"`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading limiter configuration");
            builder = builder.add_source(config::File::from(path));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("default_limits")
                .with_list_parse_key("application_limits")
                .with_list_parse_key("meta_limits")
                .with_list_parse_key("in_memory_fallback"),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| {
                LimiterError::Configuration(format!("Failed to load limiter config: {}", e))
            })
    }

    pub fn default_specs(&self) -> Vec<LimitSpec> {
        specs(&self.default_limits, self.default_limits_per_method, self.default_limits_cost)
    }

    pub fn application_specs(&self) -> Vec<LimitSpec> {
        specs(
            &self.application_limits,
            self.application_limits_per_method,
            self.application_limits_cost,
        )
    }

    pub fn meta_specs(&self) -> Vec<LimitSpec> {
        specs(&self.meta_limits, false, 1)
    }

    pub fn fallback_specs(&self) -> Vec<LimitSpec> {
        specs(&self.in_memory_fallback, false, 1)
    }

    /// Whether a fallback backend should be created.
    pub fn fallback_enabled(&self) -> bool {
        self.in_memory_fallback_enabled || !self.in_memory_fallback.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
key_prefix: MYAPP
strategy: moving-window
default_limits: ["200/day", "50/hour"]
application_limits: ["1000/hour"]
meta_limits: ["2/hour"]
headers_enabled: true
retry_after: http-date
header_mapping:
  reset: RateLimit-Reset
namespaces:
  - name: api
    limits: ["100/minute"]
  - name: internal
    parent: api
    exempt: [default, application, meta, descendants]
routes:
  - id: slow
    limits: ["1/day"]
  - id: api.search
    namespaces: [api]
    limits:
      - limit: 5/second
        methods: [GET]
        override_defaults: false
        shared_scope: search
  - id: health
    exempt: [all]
"#;

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::default();
        assert!(config.enabled);
        assert!(config.fail_on_first_breach);
        assert_eq!(config.key_prefix, "LIMITER");
        assert_eq!(config.strategy, Strategy::FixedWindow);
        assert_eq!(config.retry_after, RetryAfterFormat::DeltaSeconds);
        assert!(!config.fallback_enabled());
    }

    #[test]
    fn test_from_yaml() {
        let config = LimiterConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.key_prefix, "MYAPP");
        assert_eq!(config.strategy, Strategy::MovingWindow);
        assert_eq!(config.default_specs().len(), 2);
        assert_eq!(config.retry_after, RetryAfterFormat::HttpDate);
        assert_eq!(config.header_mapping.reset, "RateLimit-Reset");
        assert_eq!(config.header_mapping.limit, "X-RateLimit-Limit");
        assert!(config.enabled);

        assert_eq!(config.namespaces.len(), 2);
        assert_eq!(
            config.namespaces[1].exempt,
            Some(ExemptionScope::exempt_default() | ExemptionScope::DESCENDANTS)
        );
        assert_eq!(config.routes[2].exempt, Some(ExemptionScope::exempt_default()));
    }

    #[test]
    fn test_detailed_limit_entry() {
        let config = LimiterConfig::from_yaml(YAML).unwrap();
        let spec = config.routes[1].limits[0].to_spec();
        assert!(spec.validate().is_ok());
        assert!(spec.is_shared());
        assert!(!spec.overrides_defaults());
        assert!(spec.method_exempt("POST"));
        assert!(matches!(config.routes[0].limits[0], LimitEntry::Expression(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = LimiterConfig::from_yaml("default_limits: 12\nroutes: nope");
        assert!(matches!(result, Err(LimiterError::Configuration(_))));
        let yaml = "namespaces:\n  - name: a\n    exempt: [sideways]";
        assert!(LimiterConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_fallback_enabled_by_limits() {
        let config = LimiterConfig {
            in_memory_fallback: vec!["10/minute".to_string()],
            ..Default::default()
        };
        assert!(config.fallback_enabled());
        assert_eq!(config.fallback_specs().len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("scoped-limiter-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("limits.yaml");
        std::fs::write(&path, YAML).unwrap();

        let config = LimiterConfig::load(Some(&path)).unwrap();
        assert_eq!(config.key_prefix, "MYAPP");
        assert_eq!(config.routes.len(), 3);

        let from_file = LimiterConfig::from_file(&path).unwrap();
        assert_eq!(from_file.default_limits, config.default_limits);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
