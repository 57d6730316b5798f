//! Pool sizing policy and tuning knobs

use std::fmt;
use std::time::Duration;

/// Errors raised while building pool configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_endpoints ({max}) must not be lower than min_endpoints ({min})")]
    MaxBelowMin { min: usize, max: usize },

    #[error("{field} must not be negative (got {value})")]
    NegativeBound { field: &'static str, value: i64 },

    #[error("Pool for service {0} needs max_endpoints of at least 1")]
    ZeroCapacity(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid endpoint setting '{0}', expected min:max[:idle_secs]")]
    InvalidEndpointSpec(String),
}

/// Immutable sizing policy for one endpoint pool
///
/// Built only through the validating factories, so a value that exists
/// always satisfies `max_endpoints >= min_endpoints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolConfig {
    min_endpoints: usize,
    max_endpoints: usize,
    pipelined: bool,
    idle_time: Duration,
}

impl PoolConfig {
    /// Idle time used by [`PoolConfig::create`]
    pub const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(300);

    /// Creates a non-pipelined config with the [`DEFAULT_IDLE_TIME`](Self::DEFAULT_IDLE_TIME).
    ///
    /// If an endpoint is idle longer than the idle time and the pool does not
    /// fall below `min_endpoints`, it is removed from the pool.
    pub fn create(min_endpoints: usize, max_endpoints: usize) -> Result<Self, ConfigError> {
        Self::create_with_idle_time(min_endpoints, max_endpoints, Self::DEFAULT_IDLE_TIME)
    }

    /// Creates a non-pipelined config with a custom idle time.
    pub fn create_with_idle_time(
        min_endpoints: usize,
        max_endpoints: usize,
        idle_time: Duration,
    ) -> Result<Self, ConfigError> {
        Self::build(min_endpoints, max_endpoints, false, idle_time)
    }

    /// Creates a config whose endpoints may carry several requests at once.
    pub fn pipelined(
        min_endpoints: usize,
        max_endpoints: usize,
        idle_time: Duration,
    ) -> Result<Self, ConfigError> {
        Self::build(min_endpoints, max_endpoints, true, idle_time)
    }

    /// Creates a config from signed bounds as read from files or the environment.
    pub fn from_signed(
        min_endpoints: i64,
        max_endpoints: i64,
        pipelined: bool,
        idle_time: Duration,
    ) -> Result<Self, ConfigError> {
        let min = usize::try_from(min_endpoints).map_err(|_| ConfigError::NegativeBound {
            field: "min_endpoints",
            value: min_endpoints,
        })?;
        let max = usize::try_from(max_endpoints).map_err(|_| ConfigError::NegativeBound {
            field: "max_endpoints",
            value: max_endpoints,
        })?;
        Self::build(min, max, pipelined, idle_time)
    }

    fn build(
        min_endpoints: usize,
        max_endpoints: usize,
        pipelined: bool,
        idle_time: Duration,
    ) -> Result<Self, ConfigError> {
        if max_endpoints < min_endpoints {
            return Err(ConfigError::MaxBelowMin {
                min: min_endpoints,
                max: max_endpoints,
            });
        }
        Ok(Self::from_validated(min_endpoints, max_endpoints, pipelined, idle_time))
    }

    /// Callers guarantee `max_endpoints >= min_endpoints`.
    pub(crate) const fn from_validated(
        min_endpoints: usize,
        max_endpoints: usize,
        pipelined: bool,
        idle_time: Duration,
    ) -> Self {
        Self {
            min_endpoints,
            max_endpoints,
            pipelined,
            idle_time,
        }
    }

    /// Minimum number of endpoints kept per node
    pub fn min_endpoints(&self) -> usize {
        self.min_endpoints
    }

    /// Maximum number of endpoints allowed per node
    pub fn max_endpoints(&self) -> usize {
        self.max_endpoints
    }

    /// Whether an endpoint may carry multiple in-flight requests
    pub fn is_pipelined(&self) -> bool {
        self.pipelined
    }

    /// How long an unused endpoint above the minimum may stay open
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }
}

impl fmt::Display for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolConfig {{ min_endpoints: {}, max_endpoints: {}, pipelined: {}, idle_time: {:?} }}",
            self.min_endpoints, self.max_endpoints, self.pipelined, self.idle_time
        )
    }
}

/// Backpressure, retry and timeout parameters shared by the pools of a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTuning {
    /// Maximum number of requests waiting for a free endpoint
    pub queue_limit: usize,

    /// Timeout for a single connect attempt
    pub connect_timeout: Duration,

    /// Consecutive failed connects before waiting requests are failed
    pub connect_retries: u32,

    /// First reconnect delay
    pub backoff_initial: Duration,

    /// Upper bound for reconnect delays
    pub backoff_max: Duration,

    /// Deadline for requests that do not carry their own
    pub request_timeout: Duration,

    /// Ceiling applied to every request deadline
    pub max_request_timeout: Duration,

    /// Idle sweep period; `None` means half of the pool's idle time
    pub reap_interval: Option<Duration>,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            queue_limit: 1024,
            connect_timeout: Duration::from_secs(10),
            connect_retries: 5,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            request_timeout: Duration::from_secs(75),
            max_request_timeout: Duration::from_secs(600),
            reap_interval: None,
        }
    }
}

impl PoolTuning {
    /// Floor for the idle sweep period
    pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

    /// Deadline actually applied to a request asking for `requested`
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.request_timeout)
            .min(self.max_request_timeout)
    }

    /// Idle sweep period for a pool with the given config
    pub fn reap_interval_for(&self, config: &PoolConfig) -> Duration {
        self.reap_interval
            .unwrap_or(config.idle_time() / 2)
            .max(Self::MIN_REAP_INTERVAL)
    }
}
