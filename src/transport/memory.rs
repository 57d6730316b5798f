//! In-process transport
//!
//! Two modes:
//! - **echo**: every frame is answered with its own payload after a fixed latency
//! - **manual**: frames are handed to a [`MemoryServer`] and answered by the
//!   caller, which makes ordering, duplicates and link loss scriptable
//!
//! Connect failures can be injected with [`MemoryConnector::fail_next`] and
//! [`MemoryConnector::set_refusing`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connector, Frame, Link, ResponseHandler, TransportError};
use crate::request::{RequestError, RequestId};
use crate::service::ServiceType;

#[derive(Clone)]
enum Mode {
    Echo { latency: Duration },
    Manual(mpsc::UnboundedSender<Inbound>),
}

struct ConnectorState {
    mode: Mode,
    fail_next: AtomicUsize,
    refusing: AtomicBool,
    attempts: AtomicUsize,
    links: AtomicUsize,
}

/// Connector producing in-process links
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    fn with_mode(mode: Mode) -> Self {
        Self {
            state: Arc::new(ConnectorState {
                mode,
                fail_next: AtomicUsize::new(0),
                refusing: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                links: AtomicUsize::new(0),
            }),
        }
    }

    /// Links answer every frame with its payload after `latency`
    pub fn echo(latency: Duration) -> Self {
        Self::with_mode(Mode::Echo { latency })
    }

    /// Links forward frames to the returned server for scripted answers
    pub fn manual() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_mode(Mode::Manual(tx)), MemoryServer { rx })
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every connect attempt while `refusing` is set
    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Links handed out so far
    pub fn links_opened(&self) -> usize {
        self.state.links.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &str,
        service: ServiceType,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.state.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let link_id = self.state.links.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        debug!(address = %address, service = %service, link_id, "memory link opened");

        Ok(Arc::new(MemoryLink {
            shared: Arc::new(LinkShared {
                id: link_id,
                handler,
                open: AtomicBool::new(true),
            }),
            mode: self.state.mode.clone(),
        }))
    }
}

struct LinkShared {
    id: u64,
    handler: Arc<dyn ResponseHandler>,
    open: AtomicBool,
}

impl LinkShared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn deliver(&self, id: RequestId, outcome: Result<Bytes, RequestError>) {
        if self.is_open() {
            self.handler.on_response(id, outcome);
        }
    }
}

struct MemoryLink {
    shared: Arc<LinkShared>,
    mode: Mode,
}

impl Link for MemoryLink {
    fn transmit(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.shared.is_open() {
            return Err(TransportError::LinkClosed);
        }

        match &self.mode {
            Mode::Echo { latency } => {
                let shared = Arc::clone(&self.shared);
                let latency = *latency;
                tokio::spawn(async move {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    shared.deliver(frame.id, Ok(frame.payload));
                });
                Ok(())
            }
            Mode::Manual(tx) => tx
                .send(Inbound {
                    frame,
                    link: Arc::clone(&self.shared),
                })
                .map_err(|_| TransportError::LinkClosed),
        }
    }

    fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
    }
}

/// Receives frames sent over manual links
pub struct MemoryServer {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl MemoryServer {
    /// Wait for the next frame
    pub async fn next(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Next frame if one is already waiting
    pub fn try_next(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}

/// A frame received by a [`MemoryServer`], answerable any number of times
pub struct Inbound {
    pub frame: Frame,
    link: Arc<LinkShared>,
}

impl Inbound {
    pub fn id(&self) -> RequestId {
        self.frame.id
    }

    /// Id of the link the frame arrived on
    pub fn link_id(&self) -> u64 {
        self.link.id
    }

    /// Answer with a successful body
    pub fn respond(&self, body: impl Into<Bytes>) {
        self.link.deliver(self.frame.id, Ok(body.into()));
    }

    /// Answer with the frame's own payload
    pub fn echo(&self) {
        self.respond(self.frame.payload.clone());
    }

    /// Answer with a service error
    pub fn fail(&self, message: impl Into<String>) {
        self.link
            .deliver(self.frame.id, Err(RequestError::Service(message.into())));
    }

    /// Drop the link from the remote side
    pub fn close_link(&self) {
        if self.link.open.swap(false, Ordering::SeqCst) {
            self.link.handler.on_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        responses: Mutex<Vec<(RequestId, Result<Bytes, RequestError>)>>,
        closed: AtomicUsize,
    }

    impl ResponseHandler for Recorder {
        fn on_response(&self, id: RequestId, outcome: Result<Bytes, RequestError>) {
            self.responses.lock().push((id, outcome));
        }

        fn on_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(id: u64) -> Frame {
        Frame {
            id: RequestId::from_u64(id),
            service: ServiceType::View,
            payload: Bytes::from_static(b"ping"),
        }
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let connector = MemoryConnector::echo(Duration::ZERO);
        connector.fail_next(2);
        let handler = Arc::new(Recorder::default());

        for _ in 0..2 {
            let result = connector.connect("node-1", ServiceType::View, handler.clone()).await;
            assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
        }
        assert!(connector.connect("node-1", ServiceType::View, handler.clone()).await.is_ok());

        connector.set_refusing(true);
        assert!(connector.connect("node-1", ServiceType::View, handler).await.is_err());
        assert_eq!(connector.connect_attempts(), 4);
        assert_eq!(connector.links_opened(), 1);
    }

    #[tokio::test]
    async fn test_manual_round_trip() {
        let (connector, mut server) = MemoryConnector::manual();
        let handler = Arc::new(Recorder::default());
        let link = connector.connect("node-1", ServiceType::View, handler.clone()).await.unwrap();

        link.transmit(frame(1)).unwrap();
        let inbound = server.next().await.unwrap();
        assert_eq!(inbound.id(), RequestId::from_u64(1));
        inbound.respond("pong");
        inbound.fail("boom");

        let responses = handler.responses.lock().clone();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].1, Ok(Bytes::from_static(b"pong")));
        assert_eq!(responses[1].1, Err(RequestError::Service("boom".to_string())));
    }

    #[tokio::test]
    async fn test_closed_link_rejects_and_goes_quiet() {
        let (connector, mut server) = MemoryConnector::manual();
        let handler = Arc::new(Recorder::default());
        let link = connector.connect("node-1", ServiceType::View, handler.clone()).await.unwrap();

        link.transmit(frame(1)).unwrap();
        let inbound = server.next().await.unwrap();
        inbound.close_link();
        inbound.close_link();
        inbound.respond("late");

        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert!(handler.responses.lock().is_empty());
        assert!(matches!(link.transmit(frame(2)), Err(TransportError::LinkClosed)));
    }
}
