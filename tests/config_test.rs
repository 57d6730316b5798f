use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use svcpool::config::{load_config, load_from_env, load_from_yaml};
use svcpool::{PoolConfig, ServiceType};

fn write_config(yaml: &str) -> (TempDir, std::path::PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("svcpool.yaml");
    fs::write(&config_path, yaml).unwrap();
    (temp_dir, config_path)
}

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
nodes:
  - 10.0.0.1:8092
  - 10.0.0.2:8092

services:
  view:
    min_endpoints: 1
    max_endpoints: 3
    idle_time: 60
  kv:
    min_endpoints: 2
    max_endpoints: 2

tuning:
  queue_limit: 64
  request_timeout: 30
  connect_retries: 2
  reap_interval_ms: 500
"#;

    let (_dir, path) = write_config(yaml);
    let config = load_from_yaml(&path).unwrap();

    assert_eq!(config.nodes, vec!["10.0.0.1:8092", "10.0.0.2:8092"]);
    assert_eq!(config.enabled_services(), vec![ServiceType::Kv, ServiceType::View]);

    let view = config.pool_config(ServiceType::View).unwrap();
    assert_eq!(view.min_endpoints(), 1);
    assert_eq!(view.max_endpoints(), 3);
    assert_eq!(view.idle_time(), Duration::from_secs(60));
    assert!(!view.is_pipelined());

    let kv = config.pool_config(ServiceType::Kv).unwrap();
    assert!(kv.is_pipelined());
    assert_eq!(kv.idle_time(), PoolConfig::DEFAULT_IDLE_TIME);

    let tuning = config.tuning();
    assert_eq!(tuning.queue_limit, 64);
    assert_eq!(tuning.request_timeout, Duration::from_secs(30));
    assert_eq!(tuning.connect_retries, 2);
    assert_eq!(tuning.reap_interval, Some(Duration::from_millis(500)));
    // Untouched settings keep their defaults
    assert_eq!(tuning.connect_timeout, Duration::from_secs(10));
}

/// An empty file yields the catalogue defaults for every service
#[test]
fn test_yaml_defaults() {
    let (_dir, path) = write_config("{}\n");
    let config = load_from_yaml(&path).unwrap();

    assert_eq!(config.nodes, vec!["127.0.0.1:11210"]);
    assert_eq!(config.enabled_services(), ServiceType::ALL.to_vec());
    for service in ServiceType::ALL {
        assert_eq!(
            config.pool_config(service).unwrap(),
            service.default_pool_config()
        );
    }
}

#[test]
fn test_yaml_rejects_invalid_bounds() {
    let max_below_min = r#"
services:
  view:
    min_endpoints: 4
    max_endpoints: 2
"#;
    let (_dir, path) = write_config(max_below_min);
    let err = load_from_yaml(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("max_endpoints (2) must not be lower than min_endpoints (4)"));

    let negative = r#"
services:
  search:
    min_endpoints: -1
    max_endpoints: 2
"#;
    let (_dir, path) = write_config(negative);
    let err = load_from_yaml(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("must not be negative"));

    let zero = r#"
services:
  query:
    min_endpoints: 0
    max_endpoints: 0
"#;
    let (_dir, path) = write_config(zero);
    assert!(load_from_yaml(&path).is_err());
}

#[test]
fn test_yaml_rejects_unknown_service() {
    let yaml = r#"
services:
  memcached:
    min_endpoints: 0
    max_endpoints: 1
"#;
    let (_dir, path) = write_config(yaml);
    assert!(load_from_yaml(&path).is_err());
}

#[test]
fn test_yaml_accepts_service_aliases() {
    let yaml = r#"
services:
  fts:
    min_endpoints: 1
    max_endpoints: 2
  n1ql:
    min_endpoints: 0
    max_endpoints: 4
  views:
    min_endpoints: 0
    max_endpoints: 1
"#;
    let (_dir, path) = write_config(yaml);
    let config = load_from_yaml(&path).unwrap();

    assert_eq!(
        config.enabled_services(),
        vec![ServiceType::View, ServiceType::Query, ServiceType::Search]
    );
    assert_eq!(config.pool_config(ServiceType::Search).unwrap().max_endpoints(), 2);
    assert_eq!(config.pool_config(ServiceType::Query).unwrap().max_endpoints(), 4);
}

#[test]
fn test_missing_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.yaml");
    let err = load_config(Some(missing.to_str().unwrap())).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

/// Test loading configuration from environment variables
///
/// Kept as the only test in this binary touching SVCPOOL_* variables.
#[test]
fn test_load_env_config() {
    let vars = [
        ("SVCPOOL_NODES", "node-a:8092, node-b:8092"),
        ("SVCPOOL_VIEW_ENDPOINTS", "1:4:120"),
        ("SVCPOOL_QUEUE_LIMIT", "16"),
        ("SVCPOOL_REQUEST_TIMEOUT", "5"),
    ];
    let saved: Vec<(&str, Option<String>)> =
        vars.iter().map(|(key, _)| (*key, env::var(key).ok())).collect();
    for (key, value) in vars {
        env::set_var(key, value);
    }

    let result = load_from_env();

    for (key, value) in saved {
        match value {
            Some(value) => env::set_var(key, value),
            None => env::remove_var(key),
        }
    }

    let config = result.unwrap();
    assert_eq!(config.nodes, vec!["node-a:8092", "node-b:8092"]);

    let view = config.pool_config(ServiceType::View).unwrap();
    assert_eq!(view.min_endpoints(), 1);
    assert_eq!(view.max_endpoints(), 4);
    assert_eq!(view.idle_time(), Duration::from_secs(120));

    let tuning = config.tuning();
    assert_eq!(tuning.queue_limit, 16);
    assert_eq!(tuning.request_timeout, Duration::from_secs(5));
}
