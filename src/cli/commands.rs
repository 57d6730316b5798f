use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use super::OutputFormat;
use crate::config::Config;
use crate::core::{Core, PoolReport};
use crate::request::{Request, RequestKind};
use crate::service::ServiceType;
use crate::transport::MemoryConnector;

/// Resolved pool settings of one service
#[derive(Debug, Serialize)]
struct ServiceView {
    service: ServiceType,
    peer_service: &'static str,
    min_endpoints: usize,
    max_endpoints: usize,
    pipelined: bool,
    idle_time_secs: u64,
}

/// Print the pool settings every node gets, after defaults are applied
pub fn cmd_config(config: &Config, format: OutputFormat) -> Result<()> {
    let services: Vec<ServiceView> = config
        .pool_configs()
        .context("Invalid pool configuration")?
        .into_iter()
        .map(|(service, pool)| ServiceView {
            service,
            peer_service: service.peer_service(),
            min_endpoints: pool.min_endpoints(),
            max_endpoints: pool.max_endpoints(),
            pipelined: pool.is_pipelined(),
            idle_time_secs: pool.idle_time().as_secs(),
        })
        .collect();
    let tuning = config.tuning();

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "nodes": config.nodes,
                "services": services,
                "tuning": config.tuning,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Nodes: {}", config.nodes.join(", "));
            println!();
            println!(
                "{:<10} {:<10} {:>5} {:>5} {:>10} {:>10}",
                "SERVICE", "PEER", "MIN", "MAX", "PIPELINED", "IDLE"
            );
            for view in &services {
                println!(
                    "{:<10} {:<10} {:>5} {:>5} {:>10} {:>9}s",
                    view.service.name(),
                    view.peer_service,
                    view.min_endpoints,
                    view.max_endpoints,
                    view.pipelined,
                    view.idle_time_secs
                );
            }
            println!();
            println!("Queue limit:      {}", tuning.queue_limit);
            println!("Request timeout:  {:?} (max {:?})", tuning.request_timeout, tuning.max_request_timeout);
            println!("Connect timeout:  {:?}, {} retries", tuning.connect_timeout, tuning.connect_retries);
            println!("Backoff:          {:?} .. {:?}", tuning.backoff_initial, tuning.backoff_max);
        }
    }

    Ok(())
}

/// Parameters of a simulation run
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub service: ServiceType,
    pub requests: usize,
    pub concurrency: usize,
    pub latency: Duration,
    pub bucket: String,
}

/// Outcome of a simulation run
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub service: ServiceType,
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure messages and how often each occurred
    pub errors: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
    pub requests_per_sec: f64,
    pub pools: Vec<PoolReport>,
}

/// A representative request for `service`
fn sample_request(service: ServiceType, bucket: &str, n: usize) -> Request {
    let kind = match service {
        ServiceType::Kv => RequestKind::KvGet {
            key: format!("key-{}", n),
        },
        ServiceType::View => RequestKind::GetDesignDocument {
            name: format!("ddoc-{}", n % 4),
            development: false,
        },
        ServiceType::Query => RequestKind::N1qlQuery {
            statement: format!("SELECT * FROM `{}` LIMIT {}", bucket, n % 10 + 1),
        },
        ServiceType::Search => RequestKind::SearchQuery {
            index: format!("{}-index", bucket),
            query: serde_json::json!({ "match": format!("term-{}", n) }),
        },
        ServiceType::Analytics => RequestKind::AnalyticsQuery {
            statement: format!("SELECT VALUE COUNT(*) FROM `{}`", bucket),
        },
    };
    Request::new(kind, bucket, "")
}

/// Drive the configured pools with synthetic requests over the in-memory transport
pub async fn run_simulation(config: Config, options: &SimulateOptions) -> Result<SimulationReport> {
    let connector = MemoryConnector::echo(options.latency);
    let core = Core::open(config, Arc::new(connector))
        .await
        .context("Failed to open pools")?;

    info!(
        service = %options.service,
        requests = options.requests,
        concurrency = options.concurrency,
        "starting simulation"
    );

    let start = Instant::now();
    let outcomes: Vec<_> = stream::iter(0..options.requests)
        .map(|n| core.dispatch(sample_request(options.service, &options.bucket, n)).wait())
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;
    let elapsed = start.elapsed();

    let mut errors = BTreeMap::new();
    let mut succeeded = 0;
    for outcome in outcomes {
        match outcome {
            Ok(_) => succeeded += 1,
            Err(e) => *errors.entry(e.to_string()).or_insert(0) += 1,
        }
    }

    let pools = core
        .stats()
        .into_iter()
        .filter(|report| report.service == options.service)
        .collect();
    core.close().await;

    let secs = elapsed.as_secs_f64();
    Ok(SimulationReport {
        service: options.service,
        requests: options.requests,
        succeeded,
        failed: options.requests - succeeded,
        errors,
        elapsed_ms: elapsed.as_millis() as u64,
        requests_per_sec: if secs > 0.0 { options.requests as f64 / secs } else { 0.0 },
        pools,
    })
}

/// Simulate command
pub async fn cmd_simulate(config: Config, options: SimulateOptions, format: OutputFormat) -> Result<()> {
    let report = run_simulation(config, &options).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!(
                "{} requests to {} in {} ms ({:.0} req/s)",
                report.requests, report.service, report.elapsed_ms, report.requests_per_sec
            );
            println!("Succeeded: {}", report.succeeded);
            println!("Failed:    {}", report.failed);
            for (error, count) in &report.errors {
                println!("  {:>6}  {}", count, error);
            }
            for pool in &report.pools {
                let stats = &pool.stats;
                println!(
                    "{} [{}]: {} endpoints ({} created, {} evicted), {} dispatched, {} rejected",
                    pool.node,
                    pool.readiness,
                    stats.endpoints,
                    stats.total_created,
                    stats.total_evicted,
                    stats.total_dispatched,
                    stats.rejected
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSettings;

    #[test]
    fn test_sample_request_targets_service() {
        for service in ServiceType::ALL {
            assert_eq!(sample_request(service, "travel-sample", 3).service(), service);
        }
    }

    #[tokio::test]
    async fn test_simulation_completes_every_request() {
        let mut config = Config::new();
        config.services.insert(
            ServiceType::View,
            ServiceSettings {
                min_endpoints: 1,
                max_endpoints: 4,
                idle_time: 300,
                pipelined: None,
            },
        );

        let options = SimulateOptions {
            service: ServiceType::View,
            requests: 50,
            concurrency: 8,
            latency: Duration::from_millis(1),
            bucket: "beer-sample".to_string(),
        };
        let report = run_simulation(config, &options).await.unwrap();

        assert_eq!(report.succeeded, 50);
        assert_eq!(report.failed, 0);
        assert_eq!(report.pools.len(), 1);
        let stats = &report.pools[0].stats;
        assert_eq!(stats.total_dispatched, 50);
        assert!(stats.endpoints <= 4);
    }
}
