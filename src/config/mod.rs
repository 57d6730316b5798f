use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

mod pool;

pub use pool::{ConfigError, PoolConfig, PoolTuning};

use crate::service::ServiceType;

/// Pool sizing for one service as written in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Minimum endpoints per node
    pub min_endpoints: i64,

    /// Maximum endpoints per node
    pub max_endpoints: i64,

    /// Idle time in seconds before an endpoint above the minimum is closed
    #[serde(default = "default_idle_time")]
    pub idle_time: u64,

    /// Override the catalogue pipelining flag of the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelined: Option<bool>,
}

fn default_idle_time() -> u64 {
    PoolConfig::DEFAULT_IDLE_TIME.as_secs()
}

impl ServiceSettings {
    /// Validate into a [`PoolConfig`] for `service`
    pub fn to_pool_config(&self, service: ServiceType) -> Result<PoolConfig, ConfigError> {
        PoolConfig::from_signed(
            self.min_endpoints,
            self.max_endpoints,
            self.pipelined.unwrap_or_else(|| service.is_pipelined()),
            Duration::from_secs(self.idle_time),
        )
    }

    /// Parse the `min:max[:idle_secs]` shorthand used in environment variables
    pub fn parse_spec(spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpointSpec(spec.to_string());
        let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid());
        }

        let min_endpoints = parts[0].parse().map_err(|_| invalid())?;
        let max_endpoints = parts[1].parse().map_err(|_| invalid())?;
        let idle_time = match parts.get(2) {
            Some(idle) => idle.parse().map_err(|_| invalid())?,
            None => default_idle_time(),
        };

        Ok(Self {
            min_endpoints,
            max_endpoints,
            idle_time,
            pipelined: None,
        })
    }
}

/// Pool tuning as written in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningSettings {
    /// Requests allowed to wait for a free endpoint
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Consecutive failed connects before waiting requests are failed
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Maximum reconnect delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Default request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Ceiling for any request timeout in seconds
    #[serde(default = "default_max_request_timeout")]
    pub max_request_timeout: u64,

    /// Idle sweep period in milliseconds (default: half the idle time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reap_interval_ms: Option<u64>,
}

fn default_queue_limit() -> usize {
    PoolTuning::default().queue_limit
}

fn default_connect_timeout_ms() -> u64 {
    PoolTuning::default().connect_timeout.as_millis() as u64
}

fn default_connect_retries() -> u32 {
    PoolTuning::default().connect_retries
}

fn default_backoff_initial_ms() -> u64 {
    PoolTuning::default().backoff_initial.as_millis() as u64
}

fn default_backoff_max_ms() -> u64 {
    PoolTuning::default().backoff_max.as_millis() as u64
}

fn default_request_timeout() -> u64 {
    PoolTuning::default().request_timeout.as_secs()
}

fn default_max_request_timeout() -> u64 {
    PoolTuning::default().max_request_timeout.as_secs()
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            queue_limit: default_queue_limit(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout: default_request_timeout(),
            max_request_timeout: default_max_request_timeout(),
            reap_interval_ms: None,
        }
    }
}

impl TuningSettings {
    pub fn to_tuning(&self) -> PoolTuning {
        PoolTuning {
            queue_limit: self.queue_limit,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_retries: self.connect_retries,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            request_timeout: Duration::from_secs(self.request_timeout),
            max_request_timeout: Duration::from_secs(self.max_request_timeout),
            reap_interval: self.reap_interval_ms.map(Duration::from_millis),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node addresses (host:port) of the cluster
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,

    /// Pool sizing per service; services not listed use catalogue defaults
    #[serde(default)]
    pub services: BTreeMap<ServiceType, ServiceSettings>,

    /// Backpressure, retry and timeout settings
    #[serde(default)]
    pub tuning: TuningSettings,
}

fn default_nodes() -> Vec<String> {
    vec!["127.0.0.1:11210".to_string()]
}

impl Config {
    /// Create a configuration with default nodes and no service overrides
    pub fn new() -> Self {
        Self {
            nodes: default_nodes(),
            services: BTreeMap::new(),
            tuning: TuningSettings::default(),
        }
    }

    /// Pool config for `service`, falling back to the catalogue defaults
    pub fn pool_config(&self, service: ServiceType) -> Result<PoolConfig, ConfigError> {
        match self.services.get(&service) {
            Some(settings) => settings.to_pool_config(service),
            None => Ok(service.default_pool_config()),
        }
    }

    /// Services that get a pool on every node
    ///
    /// The services listed in the file, or the whole catalogue when none are.
    pub fn enabled_services(&self) -> Vec<ServiceType> {
        if self.services.is_empty() {
            ServiceType::ALL.to_vec()
        } else {
            self.services.keys().copied().collect()
        }
    }

    /// Resolved pool configs for every enabled service
    pub fn pool_configs(&self) -> Result<Vec<(ServiceType, PoolConfig)>, ConfigError> {
        self.enabled_services()
            .into_iter()
            .map(|service| Ok((service, self.pool_config(service)?)))
            .collect()
    }

    /// Resolved tuning
    pub fn tuning(&self) -> PoolTuning {
        self.tuning.to_tuning()
    }

    /// Check every pool setting without opening anything
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (service, config) in self.pool_configs()? {
            if config.max_endpoints() == 0 {
                return Err(ConfigError::ZeroCapacity(service.to_string()));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate().context("Invalid pool configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// - SVCPOOL_NODES (comma-separated host:port list, optional)
/// - SVCPOOL_<SERVICE>_ENDPOINTS (`min:max[:idle_secs]`, e.g. SVCPOOL_VIEW_ENDPOINTS=0:12:300)
/// - SVCPOOL_QUEUE_LIMIT (optional)
/// - SVCPOOL_REQUEST_TIMEOUT (seconds, optional)
/// - SVCPOOL_CONNECT_RETRIES (optional)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(nodes) = std::env::var("SVCPOOL_NODES") {
        let nodes: Vec<String> = nodes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if nodes.is_empty() {
            anyhow::bail!("SVCPOOL_NODES contains no valid node addresses");
        }
        config.nodes = nodes;
    }

    for service in ServiceType::ALL {
        let var = format!("SVCPOOL_{}_ENDPOINTS", service.name().to_ascii_uppercase());
        if let Ok(spec) = std::env::var(&var) {
            let settings = ServiceSettings::parse_spec(&spec)
                .with_context(|| format!("Invalid value for {}", var))?;
            config.services.insert(service, settings);
        }
    }

    if let Ok(limit) = std::env::var("SVCPOOL_QUEUE_LIMIT") {
        if let Ok(val) = limit.parse() {
            config.tuning.queue_limit = val;
        }
    }

    if let Ok(timeout) = std::env::var("SVCPOOL_REQUEST_TIMEOUT") {
        if let Ok(val) = timeout.parse() {
            config.tuning.request_timeout = val;
        }
    }

    if let Ok(retries) = std::env::var("SVCPOOL_CONNECT_RETRIES") {
        if let Ok(val) = retries.parse() {
            config.tuning.connect_retries = val;
        }
    }

    config.validate().context("Invalid pool configuration")?;

    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
nodes:
  - 10.0.0.1:8092
  - 10.0.0.2:8092

services:
  view:
    min_endpoints: 1
    max_endpoints: 4
    idle_time: 60
  search:
    min_endpoints: 0
    max_endpoints: 8

tuning:
  queue_limit: 64
  connect_retries: 2
  request_timeout: 30
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.enabled_services(), vec![ServiceType::View, ServiceType::Search]);

        let view = config.pool_config(ServiceType::View).unwrap();
        assert_eq!(view.min_endpoints(), 1);
        assert_eq!(view.max_endpoints(), 4);
        assert_eq!(view.idle_time(), Duration::from_secs(60));
        assert!(!view.is_pipelined());

        let search = config.pool_config(ServiceType::Search).unwrap();
        assert_eq!(search.idle_time(), PoolConfig::DEFAULT_IDLE_TIME);

        let tuning = config.tuning();
        assert_eq!(tuning.queue_limit, 64);
        assert_eq!(tuning.connect_retries, 2);
        assert_eq!(tuning.request_timeout, Duration::from_secs(30));
        assert_eq!(tuning.backoff_initial, Duration::from_millis(100));
    }

    #[test]
    fn test_default_values() {
        let config: Config = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.nodes, vec!["127.0.0.1:11210".to_string()]);
        assert_eq!(config.enabled_services().len(), ServiceType::ALL.len());
        assert_eq!(config.tuning(), PoolTuning::default());
        assert!(config.pool_config(ServiceType::Kv).unwrap().is_pipelined());
    }

    #[test]
    fn test_invalid_bounds_fail_validation() {
        let yaml = r#"
services:
  query:
    min_endpoints: 5
    max_endpoints: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::MaxBelowMin { min: 5, max: 2 }
        );
    }

    #[test]
    fn test_zero_capacity_fails_validation() {
        let yaml = r#"
services:
  view:
    min_endpoints: 0
    max_endpoints: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity(_))));
    }

    #[test]
    fn test_parse_endpoint_spec() {
        let settings = ServiceSettings::parse_spec("1:3").unwrap();
        assert_eq!((settings.min_endpoints, settings.max_endpoints), (1, 3));
        assert_eq!(settings.idle_time, 300);

        let settings = ServiceSettings::parse_spec(" 0 : 12 : 30 ").unwrap();
        assert_eq!(settings.idle_time, 30);

        assert!(ServiceSettings::parse_spec("4").is_err());
        assert!(ServiceSettings::parse_spec("a:b").is_err());
        assert!(ServiceSettings::parse_spec("1:2:3:4").is_err());
    }
}
