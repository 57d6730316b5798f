//! Endpoint pool for one service on one node
//!
//! The pool keeps between `min_endpoints` and `max_endpoints` endpoints and
//! routes every request to exactly one of them. Requests that find no free
//! endpoint wait in a bounded FIFO queue while new endpoints are connected in
//! the background; the queue is drained head-first whenever capacity appears.
//!
//! Request deadlines are owned by the pool: a timer task resolves queued and
//! in-flight requests with `Timeout` whether or not the caller is waiting.
//!
//! Locking: the pool mutex is taken before any endpoint lock, and neither is
//! held across an `.await`. Request slots are resolved after the pool lock is
//! released wherever the surrounding code allows it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::endpoint::{Endpoint, EndpointState};
use super::pending::PendingResponse;
use crate::config::{ConfigError, PoolConfig, PoolTuning};
use crate::request::{Correlator, Pending, Request, RequestError, RequestId, RequestState};
use crate::service::ServiceType;
use crate::span::{dispatch_span, SharedSpan, SpanTag, PEER_SERVICE};
use crate::transport::{Connector, ResponseHandler};

/// Whether a pool can serve requests right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// At least `min_endpoints` endpoints are connected
    Ready,
    /// Fewer than `min_endpoints` are connected; reconnects are running
    Degraded,
    Closed,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::Degraded => write!(f, "degraded"),
            Readiness::Closed => write!(f, "closed"),
        }
    }
}

/// Statistics for an endpoint pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Endpoints currently owned by the pool
    pub endpoints: usize,

    /// Owned endpoints in the connected state
    pub connected: usize,

    /// Connects in progress
    pub connecting: usize,

    /// Requests sent and not yet resolved
    pub in_flight: usize,

    /// Requests waiting for a free endpoint
    pub queued: usize,

    /// Total endpoints created
    pub total_created: u64,

    /// Total endpoints evicted for idleness
    pub total_evicted: u64,

    /// Failed connect attempts
    pub failed_connects: u64,

    /// Requests accepted by `dispatch`
    pub total_dispatched: u64,

    /// Responses delivered to callers
    pub total_completed: u64,

    /// Requests refused because the queue was full
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    evicted: AtomicU64,
    failed_connects: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

struct PoolState {
    endpoints: Vec<Arc<Endpoint>>,
    connecting: usize,
    queue: VecDeque<Request>,
    /// Deadlines of unresolved requests; entries of requests resolved
    /// elsewhere are dropped when they come due
    deadlines: HashMap<RequestId, Deadline>,
    /// When the timer task wakes next
    next_expiry: Option<Instant>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPurpose {
    /// Keeps the pool at `min_endpoints`; retries until the pool closes
    Minimum,
    /// Extra capacity for waiting requests; gives up after `connect_retries`
    Growth,
}

enum Placement {
    Sent,
    NoCapacity(Request),
    Rejected(RequestId, RequestError),
}

/// Work collected under the pool lock and finished after releasing it
#[derive(Default)]
struct Deferred {
    dead: Vec<Arc<Endpoint>>,
    failed: Vec<(RequestId, RequestError)>,
}

impl Deferred {
    fn settle(self, correlator: &Correlator) {
        for endpoint in self.dead {
            endpoint.disconnect(RequestError::ConnectionClosed);
        }
        for (id, error) in self.failed {
            correlator.complete(id, Err(error));
        }
    }
}

pub(crate) struct PoolShared {
    node: String,
    service: ServiceType,
    config: PoolConfig,
    tuning: PoolTuning,
    connector: Arc<dyn Connector>,
    correlator: Arc<Correlator>,
    state: Mutex<PoolState>,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    deadline_wake: Arc<Notify>,
}

impl PoolShared {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn dispatch(self: &Arc<Self>, request: Request) -> PendingResponse {
        let id = request.id();
        if request.service() != self.service {
            warn!(
                request_id = %id,
                request_service = %request.service(),
                service = %self.service,
                node = %self.node,
                "request does not belong to this pool"
            );
            return PendingResponse::failed(&request, RequestError::NoPool(request.service()));
        }

        let span = dispatch_span(self.service, id);
        span.set_tag(PEER_SERVICE, self.service.peer_service());
        let _entered = span.enter();

        let timeout = self.tuning.effective_timeout(request.timeout());
        let deadline = Deadline {
            at: Instant::now() + timeout,
            timeout,
        };
        let (pending, rx) = Pending::new(&request);
        let handle = PendingResponse::new(&request, rx, timeout, Arc::downgrade(self));
        self.correlator.register(id, pending);

        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            if state.closed {
                deferred.failed.push((id, RequestError::PoolClosed));
            } else {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                self.schedule_deadline(&mut state, id, deadline);
                self.route(&mut state, request, &mut deferred);
            }
        }
        deferred.settle(&self.correlator);
        handle
    }

    fn schedule_deadline(&self, state: &mut PoolState, id: RequestId, deadline: Deadline) {
        state.deadlines.insert(id, deadline);
        if state.next_expiry.map_or(true, |next| deadline.at < next) {
            state.next_expiry = Some(deadline.at);
            self.deadline_wake.notify_one();
        }
    }

    fn route(self: &Arc<Self>, state: &mut PoolState, request: Request, deferred: &mut Deferred) {
        let request = if state.queue.is_empty() {
            match self.place(state, request, deferred) {
                Placement::Sent => return,
                Placement::Rejected(id, error) => {
                    state.deadlines.remove(&id);
                    deferred.failed.push((id, error));
                    return;
                }
                Placement::NoCapacity(request) => request,
            }
        } else {
            request
        };

        let waiting = state.queue.len();
        if waiting >= self.tuning.queue_limit {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                service = %self.service,
                node = %self.node,
                queued = waiting,
                "request queue full, rejecting request"
            );
            state.deadlines.remove(&request.id());
            deferred.failed.push((request.id(), RequestError::QueueFull(waiting)));
            return;
        }

        debug!(request_id = %request.id(), queued = waiting + 1, "no free endpoint, request queued");
        state.queue.push_back(request);
        // Failed sends may have shrunk the pool below its minimum.
        self.replenish(state);
        self.grow_if_needed(state);
    }

    /// Send `request` on the least loaded endpoint with capacity
    fn place(&self, state: &mut PoolState, request: Request, deferred: &mut Deferred) -> Placement {
        loop {
            let candidate = state
                .endpoints
                .iter()
                .filter(|endpoint| endpoint.has_capacity())
                .min_by_key(|endpoint| endpoint.in_flight())
                .cloned();
            let Some(endpoint) = candidate else {
                return Placement::NoCapacity(request);
            };

            // Before sending: a response may arrive as soon as the frame is out.
            request.state_cell().advance(RequestState::Dispatched);

            match endpoint.send(&request) {
                Ok(()) => return Placement::Sent,
                Err(error @ RequestError::Encode(_)) => {
                    return Placement::Rejected(request.id(), error);
                }
                Err(error) => {
                    warn!(
                        endpoint = endpoint.id(),
                        service = %self.service,
                        error = %error,
                        "send failed, dropping endpoint"
                    );
                    state.endpoints.retain(|e| !Arc::ptr_eq(e, &endpoint));
                    deferred.dead.push(endpoint);
                }
            }
        }
    }

    /// Dispatch queued requests head-first until the queue empties or capacity runs out
    fn drain_queue(&self, state: &mut PoolState, deferred: &mut Deferred) {
        while let Some(request) = state.queue.pop_front() {
            match self.place(state, request, deferred) {
                Placement::Sent => {}
                Placement::Rejected(id, error) => {
                    state.deadlines.remove(&id);
                    deferred.failed.push((id, error));
                }
                Placement::NoCapacity(request) => {
                    state.queue.push_front(request);
                    break;
                }
            }
        }
    }

    /// Drop the deadline of `resolved`, then hand freed capacity to the queue
    fn serve_queue(self: &Arc<Self>, resolved: Option<RequestId>) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            if let Some(id) = resolved {
                state.deadlines.remove(&id);
            }
            if state.closed || state.queue.is_empty() {
                return;
            }
            self.drain_queue(&mut state, &mut deferred);
            if !deferred.dead.is_empty() {
                self.replenish(&mut state);
                self.grow_if_needed(&mut state);
            }
        }
        deferred.settle(&self.correlator);
    }

    /// Start connects for waiting requests, within `max_endpoints`
    fn grow_if_needed(self: &Arc<Self>, state: &mut PoolState) {
        if state.closed || state.queue.is_empty() {
            return;
        }

        let room = self
            .config
            .max_endpoints()
            .saturating_sub(state.endpoints.len() + state.connecting);
        let wanted = if self.config.is_pipelined() {
            usize::from(state.connecting == 0)
        } else {
            state.queue.len().saturating_sub(state.connecting)
        };

        for _ in 0..wanted.min(room) {
            state.connecting += 1;
            self.spawn_connect(ConnectPurpose::Growth);
        }
    }

    /// Start connects until the pool is back at `min_endpoints`
    fn replenish(self: &Arc<Self>, state: &mut PoolState) {
        if state.closed {
            return;
        }
        while state.endpoints.len() + state.connecting < self.config.min_endpoints() {
            state.connecting += 1;
            self.spawn_connect(ConnectPurpose::Minimum);
        }
    }

    /// Connect in the background against an already reserved slot
    fn spawn_connect(self: &Arc<Self>, purpose: ConnectPurpose) {
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move { pool.connect_with_retry(purpose).await });
        self.track(handle);
    }

    async fn connect_with_retry(self: Arc<Self>, purpose: ConnectPurpose) {
        let mut backoff = Backoff::from_tuning(&self.tuning);
        let retries = self.tuning.connect_retries.max(1);
        let mut failures = 0u32;

        loop {
            if self.is_closed() {
                return;
            }

            let error = match self.connect_once().await {
                Ok(()) => return,
                Err(error) => error,
            };

            failures += 1;
            if failures >= retries {
                self.fail_stranded(&error);
                match purpose {
                    ConnectPurpose::Growth => {
                        self.release_slot();
                        debug!(service = %self.service, node = %self.node, "giving up on extra endpoint");
                        return;
                    }
                    ConnectPurpose::Minimum => failures = 0,
                }
            }

            let delay = backoff.next_delay();
            debug!(
                service = %self.service,
                node = %self.node,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "retrying connect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connect attempt for a reserved slot; installs the endpoint on success
    async fn connect_once(self: &Arc<Self>) -> Result<(), RequestError> {
        let endpoint = Arc::new(Endpoint::new(
            self.node.clone(),
            self.service,
            self.config.is_pipelined(),
            Arc::clone(&self.correlator),
        ));
        let events = Arc::new(EndpointEvents {
            pool: Arc::downgrade(self),
            endpoint: Arc::downgrade(&endpoint),
        });

        match endpoint
            .connect(self.connector.as_ref(), events, self.tuning.connect_timeout)
            .await
        {
            Ok(()) => {
                self.install(endpoint);
                Ok(())
            }
            Err(error) => {
                self.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %self.service,
                    node = %self.node,
                    error = %error,
                    "endpoint connect failed"
                );
                Err(error)
            }
        }
    }

    fn install(self: &Arc<Self>, endpoint: Arc<Endpoint>) {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            state.connecting = state.connecting.saturating_sub(1);

            if state.closed || endpoint.state() != EndpointState::Connected {
                deferred.dead.push(endpoint);
                self.replenish(&mut state);
                self.grow_if_needed(&mut state);
            } else {
                state.endpoints.push(Arc::clone(&endpoint));
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    endpoint = endpoint.id(),
                    service = %self.service,
                    node = %self.node,
                    endpoints = state.endpoints.len(),
                    "endpoint added to pool"
                );
                self.drain_queue(&mut state, &mut deferred);
                self.grow_if_needed(&mut state);
            }
        }
        deferred.settle(&self.correlator);
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.connecting = state.connecting.saturating_sub(1);
    }

    /// Fail waiting requests when no endpoint is left to serve them
    fn fail_stranded(&self, error: &RequestError) {
        let stranded: Vec<Request> = {
            let mut state = self.state.lock();
            let serving = state
                .endpoints
                .iter()
                .any(|endpoint| endpoint.state() == EndpointState::Connected);
            if serving || state.queue.is_empty() {
                return;
            }
            let stranded: Vec<Request> = state.queue.drain(..).collect();
            for request in &stranded {
                state.deadlines.remove(&request.id());
            }
            stranded
        };

        warn!(
            service = %self.service,
            node = %self.node,
            failed = stranded.len(),
            error = %error,
            "no endpoint reachable, failing queued requests"
        );
        for request in stranded {
            self.correlator.complete(request.id(), Err(error.clone()));
        }
    }

    fn on_endpoint_response(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        id: RequestId,
        outcome: Result<bytes::Bytes, RequestError>,
    ) {
        let resolved = endpoint.on_response(id, outcome);
        if resolved {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        self.serve_queue(resolved.then_some(id));
    }

    fn on_link_closed(self: &Arc<Self>, endpoint: &Arc<Endpoint>) {
        {
            let mut state = self.state.lock();
            state.endpoints.retain(|e| !Arc::ptr_eq(e, endpoint));
            self.replenish(&mut state);
            self.grow_if_needed(&mut state);
        }

        let failed = endpoint.disconnect(RequestError::ConnectionClosed);
        warn!(
            endpoint = endpoint.id(),
            service = %self.service,
            node = %self.node,
            failed_requests = failed,
            "endpoint link lost"
        );
    }

    /// Resolve `id` with `reason` unless it already resolved
    pub(crate) fn abandon(&self, id: RequestId, reason: RequestError) -> bool {
        let mut deferred = Deferred::default();
        {
            let mut state = self.state.lock();
            state.deadlines.remove(&id);
            if let Some(position) = state.queue.iter().position(|request| request.id() == id) {
                state.queue.remove(position);
            } else if state.endpoints.iter().any(|endpoint| endpoint.forget(id)) {
                self.drain_queue(&mut state, &mut deferred);
            }
        }
        deferred.settle(&self.correlator);

        match self.correlator.take(id) {
            Some(pending) => {
                debug!(request_id = %id, reason = %reason, "request abandoned");
                pending.resolve(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Resolve every request past its deadline with `Timeout`
    ///
    /// Returns the earliest deadline still pending.
    fn expire_overdue(&self, now: Instant) -> Option<Instant> {
        let (overdue, next) = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let overdue: Vec<(RequestId, Duration)> = state
                .deadlines
                .iter()
                .filter(|(_, deadline)| deadline.at <= now)
                .map(|(id, deadline)| (*id, deadline.timeout))
                .collect();
            for (id, _) in &overdue {
                state.deadlines.remove(id);
            }
            let next = state.deadlines.values().map(|deadline| deadline.at).min();
            state.next_expiry = next;
            (overdue, next)
        };

        for (id, timeout) in overdue {
            if self.abandon(id, RequestError::Timeout(timeout)) {
                debug!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "request deadline passed");
            }
        }
        next
    }

    fn reap_idle(&self, now: Instant) -> usize {
        let evicted: Vec<Arc<Endpoint>> = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let mut evicted = Vec::new();
            while state.endpoints.len() > self.config.min_endpoints() {
                let idle_time = self.config.idle_time();
                let Some(position) = state
                    .endpoints
                    .iter()
                    .position(|endpoint| endpoint.is_idle_eligible(now, idle_time))
                else {
                    break;
                };
                evicted.push(state.endpoints.remove(position));
            }
            evicted
        };

        if evicted.is_empty() {
            return 0;
        }

        self.counters
            .evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for endpoint in &evicted {
            endpoint.disconnect(RequestError::ConnectionClosed);
        }
        debug!(
            service = %self.service,
            node = %self.node,
            evicted = evicted.len(),
            "evicted idle endpoints"
        );
        evicted.len()
    }

    /// Close the pool and resolve everything outstanding with `PoolClosed`
    ///
    /// Returns the background tasks, already aborted.
    fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let (endpoints, queued) = {
            let mut state = self.state.lock();
            if state.closed {
                return Vec::new();
            }
            state.closed = true;
            state.connecting = 0;
            state.deadlines.clear();
            state.next_expiry = None;
            (
                std::mem::take(&mut state.endpoints),
                state.queue.drain(..).collect::<Vec<_>>(),
            )
        };

        for request in &queued {
            self.correlator.complete(request.id(), Err(RequestError::PoolClosed));
        }
        let mut in_flight = 0;
        for endpoint in &endpoints {
            in_flight += endpoint.disconnect(RequestError::PoolClosed);
        }
        for (_, pending) in self.correlator.drain() {
            pending.resolve(Err(RequestError::PoolClosed));
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }

        info!(
            service = %self.service,
            node = %self.node,
            endpoints = endpoints.len(),
            queued = queued.len(),
            in_flight,
            "pool closed"
        );
        tasks
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            endpoints: state.endpoints.len(),
            connected: state
                .endpoints
                .iter()
                .filter(|endpoint| endpoint.state() == EndpointState::Connected)
                .count(),
            connecting: state.connecting,
            in_flight: state.endpoints.iter().map(|endpoint| endpoint.in_flight()).sum(),
            queued: state.queue.len(),
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_evicted: self.counters.evicted.load(Ordering::Relaxed),
            failed_connects: self.counters.failed_connects.load(Ordering::Relaxed),
            total_dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            total_completed: self.counters.completed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn readiness(&self) -> Readiness {
        let state = self.state.lock();
        if state.closed {
            return Readiness::Closed;
        }
        let connected = state
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.state() == EndpointState::Connected)
            .count();
        if connected >= self.config.min_endpoints() {
            Readiness::Ready
        } else {
            Readiness::Degraded
        }
    }
}

/// Transport callbacks for one endpoint
struct EndpointEvents {
    pool: Weak<PoolShared>,
    endpoint: Weak<Endpoint>,
}

impl ResponseHandler for EndpointEvents {
    fn on_response(&self, id: RequestId, outcome: Result<bytes::Bytes, RequestError>) {
        if let (Some(pool), Some(endpoint)) = (self.pool.upgrade(), self.endpoint.upgrade()) {
            pool.on_endpoint_response(&endpoint, id, outcome);
        }
    }

    fn on_closed(&self) {
        if let (Some(pool), Some(endpoint)) = (self.pool.upgrade(), self.endpoint.upgrade()) {
            pool.on_link_closed(&endpoint);
        }
    }
}

/// Wakes at the earliest pending deadline, or when an earlier one is scheduled
fn spawn_deadline_timer(shared: &Arc<PoolShared>) -> JoinHandle<()> {
    let pool = Arc::downgrade(shared);
    let wake = Arc::clone(&shared.deadline_wake);

    tokio::spawn(async move {
        loop {
            let next = match pool.upgrade() {
                Some(pool) if !pool.is_closed() => pool.expire_overdue(Instant::now()),
                _ => break,
            };
            match next {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = wake.notified() => {}
                    }
                }
                None => wake.notified().await,
            }
        }
    })
}

fn spawn_reaper(shared: &Arc<PoolShared>) -> JoinHandle<()> {
    let pool = Arc::downgrade(shared);
    let period = shared.tuning.reap_interval_for(&shared.config);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }
            pool.reap_idle(Instant::now());
        }
    })
}

/// Pool of endpoints for one service on one node
pub struct EndpointPool {
    shared: Arc<PoolShared>,
}

impl EndpointPool {
    /// Open a pool and connect its minimum endpoints
    ///
    /// Endpoints that fail to connect are retried in the background and the
    /// pool reports [`Readiness::Degraded`] until they come up. Only invalid
    /// configuration makes this fail.
    pub async fn open(
        node: impl Into<String>,
        service: ServiceType,
        config: PoolConfig,
        tuning: PoolTuning,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        if config.max_endpoints() == 0 {
            return Err(ConfigError::ZeroCapacity(service.to_string()));
        }

        let node = node.into();
        let min = config.min_endpoints();
        let shared = Arc::new(PoolShared {
            node,
            service,
            config,
            tuning,
            connector,
            correlator: Arc::new(Correlator::new()),
            state: Mutex::new(PoolState {
                endpoints: Vec::with_capacity(config.max_endpoints()),
                connecting: min,
                queue: VecDeque::new(),
                deadlines: HashMap::new(),
                next_expiry: None,
                closed: false,
            }),
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
            deadline_wake: Arc::new(Notify::new()),
        });

        shared.track(spawn_reaper(&shared));
        shared.track(spawn_deadline_timer(&shared));

        let attempts = (0..min).map(|_| shared.connect_once());
        let results = futures::future::join_all(attempts).await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        for _ in 0..failed {
            shared.spawn_connect(ConnectPurpose::Minimum);
        }

        if failed > 0 {
            warn!(
                service = %shared.service,
                node = %shared.node,
                connected = min - failed,
                min_endpoints = min,
                "pool degraded, reconnecting in background"
            );
        } else {
            info!(
                service = %shared.service,
                node = %shared.node,
                %config,
                "pool ready"
            );
        }

        Ok(Self { shared })
    }

    /// Route a request to an endpoint; the handle resolves exactly once
    pub fn dispatch(&self, request: Request) -> PendingResponse {
        self.shared.dispatch(request)
    }

    /// Attach `span` to the request, then dispatch it
    pub fn dispatch_with_span(&self, request: Request, span: SharedSpan) -> PendingResponse {
        self.dispatch(request.with_span(span))
    }

    /// Evict endpoints idle for at least `idle_time`, never going below `min_endpoints`
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle(Instant::now())
    }

    /// Close the pool; queued and in-flight requests fail with `PoolClosed`
    pub async fn close(&self) {
        for task in self.shared.shutdown() {
            let _ = task.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn readiness(&self) -> Readiness {
        self.shared.readiness()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Endpoints currently owned by the pool
    pub fn size(&self) -> usize {
        self.shared.state.lock().endpoints.len()
    }

    pub fn node(&self) -> &str {
        &self.shared.node
    }

    pub fn service(&self) -> ServiceType {
        self.shared.service
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn tuning(&self) -> &PoolTuning {
        &self.shared.tuning
    }
}

impl Drop for EndpointPool {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("node", &self.shared.node)
            .field("service", &self.shared.service)
            .field("config", &self.shared.config)
            .field("stats", &self.shared.stats())
            .finish()
    }
}
