//! svcpool - endpoint pools for the services of a clustered database

pub mod cli;
pub mod config;
pub mod core;
pub mod pool;
pub mod request;
pub mod service;
pub mod span;
pub mod transport;

pub use crate::config::{Config, ConfigError, PoolConfig, PoolTuning};
pub use crate::core::Core;
pub use crate::pool::{EndpointPool, PendingResponse, PoolStats, Readiness};
pub use crate::request::{Request, RequestError, RequestId, RequestKind, RequestState, Response};
pub use crate::service::ServiceType;
