//! Service catalogue
//!
//! Every endpoint pool serves exactly one service on one node. The catalogue
//! fixes what differs between services at the pool level: whether a single
//! connection may pipeline requests, how large the pool is by default, and
//! which name is written into the `peer.service` tag of a request span.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{ConfigError, PoolConfig};

/// A logical service exposed by every node of the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Key/value (binary protocol)
    Kv,
    /// Map/reduce views
    #[serde(alias = "views")]
    View,
    /// N1QL query
    #[serde(alias = "n1ql")]
    Query,
    /// Full-text search
    #[serde(alias = "fts")]
    Search,
    /// Analytics
    Analytics,
}

impl ServiceType {
    /// All known services, in catalogue order
    pub const ALL: [ServiceType; 5] = [
        ServiceType::Kv,
        ServiceType::View,
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
    ];

    /// Name used in configuration files and logs
    pub fn name(&self) -> &'static str {
        match self {
            ServiceType::Kv => "kv",
            ServiceType::View => "view",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
        }
    }

    /// Value written into the `peer.service` span tag
    pub fn peer_service(&self) -> &'static str {
        match self {
            ServiceType::Kv => "kv",
            ServiceType::View => "view",
            ServiceType::Query => "n1ql",
            ServiceType::Search => "fts",
            ServiceType::Analytics => "analytics",
        }
    }

    /// Whether one endpoint of this service may carry several requests at once
    pub fn is_pipelined(&self) -> bool {
        matches!(self, ServiceType::Kv)
    }

    /// Default `(min, max)` endpoints per node
    pub fn default_endpoints(&self) -> (usize, usize) {
        match self {
            ServiceType::Kv => (1, 1),
            _ => (0, 12),
        }
    }

    /// Wire code used by the frame codec
    pub fn code(&self) -> u8 {
        match self {
            ServiceType::Kv => 0x01,
            ServiceType::View => 0x02,
            ServiceType::Query => 0x03,
            ServiceType::Search => 0x04,
            ServiceType::Analytics => 0x05,
        }
    }

    /// Inverse of [`ServiceType::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Pool configuration with the catalogue defaults for this service
    pub fn default_pool_config(&self) -> PoolConfig {
        let (min, max) = self.default_endpoints();
        PoolConfig::from_validated(min, max, self.is_pipelined(), PoolConfig::DEFAULT_IDLE_TIME)
    }

    /// Pool configuration for this service with the default idle time
    pub fn pool_config(&self, min_endpoints: usize, max_endpoints: usize) -> Result<PoolConfig, ConfigError> {
        self.pool_config_with_idle_time(min_endpoints, max_endpoints, PoolConfig::DEFAULT_IDLE_TIME)
    }

    /// Pool configuration for this service with a custom idle time
    pub fn pool_config_with_idle_time(
        &self,
        min_endpoints: usize,
        max_endpoints: usize,
        idle_time: Duration,
    ) -> Result<PoolConfig, ConfigError> {
        if self.is_pipelined() {
            PoolConfig::pipelined(min_endpoints, max_endpoints, idle_time)
        } else {
            PoolConfig::create_with_idle_time(min_endpoints, max_endpoints, idle_time)
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kv" => Ok(ServiceType::Kv),
            "view" | "views" => Ok(ServiceType::View),
            "query" | "n1ql" => Ok(ServiceType::Query),
            "search" | "fts" => Ok(ServiceType::Search),
            "analytics" => Ok(ServiceType::Analytics),
            other => Err(ConfigError::UnknownService(other.to_string())),
        }
    }
}
