//! A single logical connection to a service
//!
//! An endpoint owns at most one transport link and tracks which correlation
//! ids are in flight on it. Result slots live in the pool-wide
//! [`Correlator`]; the endpoint only decides when a slot is resolved.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::request::{Correlator, Request, RequestError, RequestId, Response};
use crate::service::ServiceType;
use crate::transport::{Connector, Frame, Link, ResponseHandler};

/// Connection state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct EndpointInner {
    state: EndpointState,
    link: Option<Arc<dyn Link>>,
    in_flight: HashSet<RequestId>,
    last_activity: Instant,
}

pub struct Endpoint {
    id: u64,
    address: String,
    service: ServiceType,
    pipelined: bool,
    correlator: Arc<Correlator>,
    inner: Mutex<EndpointInner>,
}

impl Endpoint {
    pub fn new(
        address: impl Into<String>,
        service: ServiceType,
        pipelined: bool,
        correlator: Arc<Correlator>,
    ) -> Self {
        static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            address: address.into(),
            service,
            pipelined,
            correlator,
            inner: Mutex::new(EndpointInner {
                state: EndpointState::Disconnected,
                link: None,
                in_flight: HashSet::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn state(&self) -> EndpointState {
        self.inner.lock().state
    }

    /// Number of requests sent and not yet resolved
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Connected and able to take another request right now
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == EndpointState::Connected && (self.pipelined || inner.in_flight.is_empty())
    }

    /// Open the transport link
    ///
    /// On failure the endpoint is back in `Disconnected` and may be retried.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        handler: Arc<dyn ResponseHandler>,
        timeout: Duration,
    ) -> Result<(), RequestError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Disconnected {
                return Err(RequestError::Connection(format!(
                    "endpoint {} is {:?}, not disconnected",
                    self.id, inner.state
                )));
            }
            inner.state = EndpointState::Connecting;
        }

        debug!(endpoint = self.id, address = %self.address, service = %self.service, "connecting endpoint");

        let result = tokio::time::timeout(
            timeout,
            connector.connect(&self.address, self.service, handler),
        )
        .await;

        let mut inner = self.inner.lock();
        match result {
            Ok(Ok(link)) => {
                if inner.state != EndpointState::Connecting {
                    // Disconnected while the connect was in progress.
                    link.close();
                    return Err(RequestError::ConnectionClosed);
                }
                inner.link = Some(link);
                inner.state = EndpointState::Connected;
                inner.last_activity = Instant::now();
                info!(endpoint = self.id, address = %self.address, service = %self.service, "endpoint connected");
                Ok(())
            }
            Ok(Err(e)) => {
                inner.state = EndpointState::Disconnected;
                Err(e.into())
            }
            Err(_) => {
                inner.state = EndpointState::Disconnected;
                Err(RequestError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    self.address, timeout
                )))
            }
        }
    }

    /// Hand a request to the transport
    ///
    /// The request stays with the caller; on error it was not sent.
    pub fn send(&self, request: &Request) -> Result<(), RequestError> {
        let payload = request.encode_payload()?;
        let id = request.id();

        let link = {
            let mut inner = self.inner.lock();
            if inner.state != EndpointState::Connected {
                return Err(RequestError::ConnectionClosed);
            }
            if !self.pipelined && !inner.in_flight.is_empty() {
                return Err(RequestError::Connection(format!(
                    "endpoint {} already has a request in flight",
                    self.id
                )));
            }
            let Some(link) = inner.link.clone() else {
                return Err(RequestError::ConnectionClosed);
            };
            inner.in_flight.insert(id);
            inner.last_activity = Instant::now();
            link
        };

        let frame = Frame {
            id,
            service: self.service,
            payload,
        };
        if let Err(e) = link.transmit(frame) {
            self.inner.lock().in_flight.remove(&id);
            return Err(e.into());
        }

        debug!(endpoint = self.id, request_id = %id, "request sent");
        Ok(())
    }

    /// Resolve the request `id` with what came back over the link
    ///
    /// Returns false for ids not in flight here; those are dropped.
    pub fn on_response(&self, id: RequestId, outcome: Result<Bytes, RequestError>) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.in_flight.remove(&id) {
                debug!(endpoint = self.id, request_id = %id, "response for unknown correlation id dropped");
                return false;
            }
            inner.last_activity = Instant::now();
        }

        self.correlator
            .complete(id, outcome.map(|body| Response::new(id, body)));
        true
    }

    /// Stop tracking `id` without resolving it
    pub fn forget(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.in_flight.remove(&id);
        if removed {
            inner.last_activity = Instant::now();
        }
        removed
    }

    /// Whether the endpoint is unused and has been for at least `idle_time`
    pub fn is_idle_eligible(&self, now: Instant, idle_time: Duration) -> bool {
        let inner = self.inner.lock();
        inner.state == EndpointState::Connected
            && inner.in_flight.is_empty()
            && now.saturating_duration_since(inner.last_activity) >= idle_time
    }

    /// Close the link and fail whatever is still in flight with `reason`
    ///
    /// Returns the number of requests resolved. Calling it again is a no-op.
    pub fn disconnect(&self, reason: RequestError) -> usize {
        let (link, in_flight) = {
            let mut inner = self.inner.lock();
            if inner.state == EndpointState::Disconnected && inner.link.is_none() {
                return 0;
            }
            inner.state = EndpointState::Disconnecting;
            let in_flight: Vec<RequestId> = inner.in_flight.drain().collect();
            (inner.link.take(), in_flight)
        };

        if let Some(link) = link {
            link.close();
        }

        if !in_flight.is_empty() {
            warn!(
                endpoint = self.id,
                address = %self.address,
                in_flight = in_flight.len(),
                reason = %reason,
                "disconnecting endpoint with requests in flight"
            );
        }
        for id in &in_flight {
            self.correlator.complete(*id, Err(reason.clone()));
        }

        self.inner.lock().state = EndpointState::Disconnected;
        debug!(endpoint = self.id, address = %self.address, "endpoint disconnected");
        in_flight.len()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("service", &self.service)
            .field("state", &inner.state)
            .field("in_flight", &inner.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Pending, RequestState, ResultReceiver};
    use crate::transport::{MemoryConnector, MemoryServer};

    struct NullHandler;

    impl ResponseHandler for NullHandler {
        fn on_response(&self, _id: RequestId, _outcome: Result<Bytes, RequestError>) {}
        fn on_closed(&self) {}
    }

    fn tracked_request(correlator: &Correlator) -> (Request, ResultReceiver) {
        let request = Request::get_design_document("beers", false, "beer-sample", "");
        let (pending, rx) = Pending::new(&request);
        correlator.register(request.id(), pending);
        (request, rx)
    }

    async fn connected(pipelined: bool) -> (Endpoint, Arc<Correlator>, MemoryServer) {
        let (connector, server) = MemoryConnector::manual();
        let correlator = Arc::new(Correlator::new());
        let endpoint = Endpoint::new("node-1:8092", ServiceType::View, pipelined, correlator.clone());
        endpoint
            .connect(&connector, Arc::new(NullHandler), Duration::from_secs(1))
            .await
            .unwrap();
        (endpoint, correlator, server)
    }

    #[tokio::test]
    async fn test_connect_and_respond() {
        let (endpoint, correlator, mut server) = connected(false).await;
        assert_eq!(endpoint.state(), EndpointState::Connected);

        let (request, rx) = tracked_request(&correlator);
        endpoint.send(&request).unwrap();
        assert_eq!(endpoint.in_flight(), 1);

        let inbound = server.next().await.unwrap();
        assert_eq!(inbound.id(), request.id());
        assert!(endpoint.on_response(request.id(), Ok(Bytes::from_static(b"doc"))));
        assert_eq!(endpoint.in_flight(), 0);

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"doc");
        assert_eq!(request.state(), RequestState::Completed);

        // A second response for the same id is dropped.
        assert!(!endpoint.on_response(request.id(), Ok(Bytes::from_static(b"again"))));
    }

    #[tokio::test]
    async fn test_non_pipelined_rejects_second_request() {
        let (endpoint, correlator, _server) = connected(false).await;
        let (first, _rx1) = tracked_request(&correlator);
        let (second, _rx2) = tracked_request(&correlator);

        endpoint.send(&first).unwrap();
        assert!(!endpoint.has_capacity());
        assert!(matches!(endpoint.send(&second), Err(RequestError::Connection(_))));
        assert_eq!(endpoint.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_pipelined_carries_many() {
        let (endpoint, correlator, _server) = connected(true).await;
        for _ in 0..4 {
            let (request, _rx) = tracked_request(&correlator);
            endpoint.send(&request).unwrap();
        }
        assert_eq!(endpoint.in_flight(), 4);
        assert!(endpoint.has_capacity());
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight() {
        let (endpoint, correlator, _server) = connected(true).await;
        let (a, rx_a) = tracked_request(&correlator);
        let (b, rx_b) = tracked_request(&correlator);
        endpoint.send(&a).unwrap();
        endpoint.send(&b).unwrap();

        assert_eq!(endpoint.disconnect(RequestError::ConnectionClosed), 2);
        assert_eq!(endpoint.state(), EndpointState::Disconnected);
        assert_eq!(rx_a.await.unwrap(), Err(RequestError::ConnectionClosed));
        assert_eq!(rx_b.await.unwrap(), Err(RequestError::ConnectionClosed));

        assert_eq!(endpoint.disconnect(RequestError::ConnectionClosed), 0);
        assert!(matches!(endpoint.send(&a), Err(RequestError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_failed_connect_is_retryable() {
        let connector = MemoryConnector::echo(Duration::ZERO);
        connector.fail_next(1);
        let endpoint = Endpoint::new("node-1:8092", ServiceType::View, false, Arc::new(Correlator::new()));

        let err = endpoint
            .connect(&connector, Arc::new(NullHandler), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Connection(_)));
        assert_eq!(endpoint.state(), EndpointState::Disconnected);

        endpoint
            .connect(&connector, Arc::new(NullHandler), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(endpoint.state(), EndpointState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eligibility() {
        let (endpoint, correlator, _server) = connected(false).await;
        let idle = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!endpoint.is_idle_eligible(Instant::now(), idle));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(endpoint.is_idle_eligible(Instant::now(), idle));

        let (request, _rx) = tracked_request(&correlator);
        endpoint.send(&request).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!endpoint.is_idle_eligible(Instant::now(), idle));

        assert!(endpoint.forget(request.id()));
        assert!(!endpoint.is_idle_eligible(Instant::now(), idle));
    }
}
