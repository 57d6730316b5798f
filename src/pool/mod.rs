//! Endpoint pooling
//!
//! This module provides:
//! - Endpoints: one logical connection each, pipelined or one request at a time
//! - Per-service pools sized between a minimum and a maximum
//! - A bounded FIFO wait queue with background growth
//! - Idle eviction above the minimum and reconnects with backoff

mod backoff;
mod endpoint;
mod endpoint_pool;
mod pending;

pub use backoff::Backoff;
pub use endpoint::{Endpoint, EndpointState};
pub use endpoint_pool::{EndpointPool, PoolStats, Readiness};
pub use pending::PendingResponse;
