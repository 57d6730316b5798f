use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Config, ConfigError, PoolTuning};
use crate::pool::{EndpointPool, PendingResponse, PoolStats, Readiness};
use crate::request::{Request, RequestError};
use crate::service::ServiceType;
use crate::transport::Connector;

/// Pools of one service across the cluster's nodes
struct ServicePools {
    pools: Vec<EndpointPool>,
    /// Counter for round-robin node selection
    counter: AtomicUsize,
}

impl ServicePools {
    /// Round-robin over the nodes, skipping pools that are not ready
    fn select(&self) -> Option<&EndpointPool> {
        let len = self.pools.len();
        if len == 0 {
            return None;
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;

        (0..len)
            .map(|offset| &self.pools[(start + offset) % len])
            .find(|pool| pool.readiness() == Readiness::Ready)
            .or_else(|| self.pools.get(start))
    }
}

/// Stats of one pool, labelled with its service and node
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub service: ServiceType,
    pub node: String,
    pub readiness: Readiness,
    pub stats: PoolStats,
}

/// Registry of endpoint pools, one per service per node
///
/// Requests are routed by their service and spread round-robin over the
/// nodes. Shared by the CLI commands and embedding applications.
pub struct Core {
    config: Arc<Config>,
    tuning: PoolTuning,
    services: BTreeMap<ServiceType, ServicePools>,
}

impl Core {
    /// Open a pool for every enabled service on every configured node
    pub async fn open(config: Config, connector: Arc<dyn Connector>) -> Result<Self, ConfigError> {
        config.validate()?;
        let tuning = config.tuning();

        let mut services = BTreeMap::new();
        for (service, pool_config) in config.pool_configs()? {
            let opening = config.nodes.iter().map(|node| {
                EndpointPool::open(
                    node.clone(),
                    service,
                    pool_config,
                    tuning.clone(),
                    Arc::clone(&connector),
                )
            });
            let pools = futures::future::join_all(opening)
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;

            debug!(service = %service, nodes = pools.len(), %pool_config, "service pools opened");
            services.insert(
                service,
                ServicePools {
                    pools,
                    counter: AtomicUsize::new(0),
                },
            );
        }

        info!(
            nodes = config.nodes.len(),
            services = services.len(),
            "core initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            tuning,
            services,
        })
    }

    /// Route a request to a pool of its service
    ///
    /// Without a pool for the service the handle resolves with `NoPool`.
    pub fn dispatch(&self, request: Request) -> PendingResponse {
        let service = request.service();
        match self.services.get(&service).and_then(ServicePools::select) {
            Some(pool) => pool.dispatch(request),
            None => {
                debug!(service = %service, request_id = %request.id(), "no pool for service");
                PendingResponse::failed(&request, RequestError::NoPool(service))
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tuning(&self) -> &PoolTuning {
        &self.tuning
    }

    /// Services with at least one pool
    pub fn services(&self) -> Vec<ServiceType> {
        self.services.keys().copied().collect()
    }

    /// Pools of `service`, one per node
    pub fn pools(&self, service: ServiceType) -> &[EndpointPool] {
        self.services
            .get(&service)
            .map(|entry| entry.pools.as_slice())
            .unwrap_or(&[])
    }

    /// Pool of `service` on `node`
    pub fn pool(&self, service: ServiceType, node: &str) -> Option<&EndpointPool> {
        self.pools(service).iter().find(|pool| pool.node() == node)
    }

    /// Worst readiness across all pools
    pub fn readiness(&self) -> Readiness {
        let mut overall = Readiness::Ready;
        for pool in self.services.values().flat_map(|entry| entry.pools.iter()) {
            match pool.readiness() {
                Readiness::Closed => return Readiness::Closed,
                Readiness::Degraded => overall = Readiness::Degraded,
                Readiness::Ready => {}
            }
        }
        overall
    }

    pub fn stats(&self) -> Vec<PoolReport> {
        self.services
            .iter()
            .flat_map(|(service, entry)| {
                entry.pools.iter().map(move |pool| PoolReport {
                    service: *service,
                    node: pool.node().to_string(),
                    readiness: pool.readiness(),
                    stats: pool.stats(),
                })
            })
            .collect()
    }

    /// Close every pool
    pub async fn close(&self) {
        let closing = self
            .services
            .values()
            .flat_map(|entry| entry.pools.iter())
            .map(|pool| pool.close());
        futures::future::join_all(closing).await;
        info!("core closed");
    }
}
