//! Request envelope and response correlation
//!
//! A [`Request`] is the generic envelope every service request travels in:
//! target bucket, credentials, a process-unique correlation id, an optional
//! span capability and an optional timeout. What the request actually asks for
//! is the [`RequestKind`] variant, which also decides the target service.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod correlator;

pub use correlator::{Correlator, Pending};
pub(crate) use correlator::ResultReceiver;

use crate::service::ServiceType;
use crate::span::{SharedSpan, PEER_SERVICE};

/// Process-unique correlation identity of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id read back from the wire
    pub fn from_u64(value: u64) -> Self {
        RequestId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Terminal and non-terminal failures of a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Failed to connect to endpoint: {0}")]
    Connection(String),

    #[error("Endpoint connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("No endpoint pool for service {0}")]
    NoPool(ServiceType),

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Service returned an error: {0}")]
    Service(String),
}

/// Successful response to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    id: RequestId,
    body: Bytes,
}

impl Response {
    pub fn new(id: RequestId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// What a request asks the service for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    /// Fetch a design document by name
    GetDesignDocument { name: String, development: bool },

    /// Query a view of a design document
    ViewQuery {
        design_document: String,
        view: String,
        development: bool,
        query: String,
    },

    /// Full-text search against an index
    SearchQuery {
        index: String,
        query: serde_json::Value,
    },

    /// N1QL statement
    N1qlQuery { statement: String },

    /// Analytics statement
    AnalyticsQuery { statement: String },

    /// Fetch a document by key
    KvGet { key: String },
}

impl RequestKind {
    /// Service this kind of request is routed to
    pub fn service(&self) -> ServiceType {
        match self {
            RequestKind::GetDesignDocument { .. } | RequestKind::ViewQuery { .. } => ServiceType::View,
            RequestKind::SearchQuery { .. } => ServiceType::Search,
            RequestKind::N1qlQuery { .. } => ServiceType::Query,
            RequestKind::AnalyticsQuery { .. } => ServiceType::Analytics,
            RequestKind::KvGet { .. } => ServiceType::Kv,
        }
    }
}

/// Bucket credentials carried by a request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Created = 0,
    Dispatched = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestState::Created,
            1 => RequestState::Dispatched,
            2 => RequestState::Completed,
            3 => RequestState::Failed,
            _ => RequestState::Cancelled,
        }
    }
}

/// Shared, lock-free state of one request
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(RequestState::Created as u8))
    }

    pub(crate) fn get(&self) -> RequestState {
        RequestState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`; terminal states are final.
    ///
    /// Leaving a terminal state is a logic error: it trips an assertion in
    /// debug builds and is ignored otherwise.
    pub(crate) fn advance(&self, next: RequestState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = RequestState::from_u8(current);
            if state.is_terminal() {
                warn!(from = ?state, to = ?next, "ignoring transition out of a terminal request state");
                debug_assert!(false, "request resolved twice: {:?} -> {:?}", state, next);
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    bucket: &'a str,
    username: &'a str,
    #[serde(flatten)]
    kind: &'a RequestKind,
}

/// Generic request envelope
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    bucket: String,
    credentials: Credentials,
    timeout: Option<Duration>,
    span: Option<SharedSpan>,
    state: Arc<StateCell>,
}

impl Request {
    /// Create a request authenticating with the bucket name as username
    pub fn new(kind: RequestKind, bucket: impl Into<String>, password: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let username = bucket.clone();
        Self::with_credentials(kind, bucket, username, password)
    }

    /// Create a request with an explicit username
    pub fn with_credentials(
        kind: RequestKind,
        bucket: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: RequestId::next(),
            kind,
            bucket: bucket.into(),
            credentials: Credentials::new(username, password),
            timeout: None,
            span: None,
            state: Arc::new(StateCell::new()),
        }
    }

    /// Fetch design document `name`, optionally from the development namespace
    pub fn get_design_document(
        name: impl Into<String>,
        development: bool,
        bucket: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(
            RequestKind::GetDesignDocument {
                name: name.into(),
                development,
            },
            bucket,
            password,
        )
    }

    /// Like [`Request::get_design_document`] with an explicit username
    pub fn get_design_document_as(
        name: impl Into<String>,
        development: bool,
        bucket: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::with_credentials(
            RequestKind::GetDesignDocument {
                name: name.into(),
                development,
            },
            bucket,
            username,
            password,
        )
    }

    /// Set an explicit timeout (capped by the pool's ceiling)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a span; see [`Request::attach_span`]
    pub fn with_span(mut self, span: SharedSpan) -> Self {
        self.attach_span(span);
        self
    }

    /// Attach a span and tag it with the peer service of this request.
    ///
    /// Each attached span is tagged exactly once, here, so the tag is always
    /// in place before the request reaches an endpoint.
    pub fn attach_span(&mut self, span: SharedSpan) {
        span.set_tag(PEER_SERVICE, self.service().peer_service());
        self.span = Some(span);
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn service(&self) -> ServiceType {
        self.kind.service()
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn username(&self) -> &str {
        self.credentials.username()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn span(&self) -> Option<&SharedSpan> {
        self.span.as_ref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &Arc<StateCell> {
        &self.state
    }

    /// JSON body handed to the transport
    pub fn encode_payload(&self) -> Result<Bytes, RequestError> {
        let envelope = Envelope {
            bucket: &self.bucket,
            username: self.credentials.username(),
            kind: &self.kind,
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| RequestError::Encode(e.to_string()))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("bucket", &self.bucket)
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .field("traced", &self.span.is_some())
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::MemorySpan;

    #[test]
    fn test_ids_are_unique() {
        let a = Request::get_design_document("beers", false, "beer-sample", "");
        let b = Request::get_design_document("beers", false, "beer-sample", "");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_username_defaults_to_bucket() {
        let request = Request::get_design_document("beers", true, "beer-sample", "secret");
        assert_eq!(request.username(), "beer-sample");
        assert_eq!(request.credentials().password(), "secret");
        assert_eq!(request.service(), ServiceType::View);
        assert!(matches!(
            request.kind(),
            RequestKind::GetDesignDocument { name, development: true } if name == "beers"
        ));

        let request = Request::get_design_document_as("beers", false, "beer-sample", "app", "pw");
        assert_eq!(request.username(), "app");
    }

    #[test]
    fn test_debug_redacts_password() {
        let request = Request::get_design_document("beers", false, "beer-sample", "hunter2");
        let rendered = format!("{:?}", request);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_attaching_span_tags_peer_service_once() {
        let span = Arc::new(MemorySpan::new());
        let request = Request::new(
            RequestKind::SearchQuery {
                index: "hotels".to_string(),
                query: serde_json::json!({ "match": "pool" }),
            },
            "travel-sample",
            "",
        )
        .with_span(span.clone());

        assert!(request.span().is_some());
        assert_eq!(span.tags(), vec![(PEER_SERVICE, "fts".to_string())]);
    }

    #[test]
    fn test_payload_contains_envelope_and_kind() {
        let request = Request::get_design_document("beers", true, "beer-sample", "pw");
        let payload = request.encode_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["bucket"], "beer-sample");
        assert_eq!(value["type"], "get_design_document");
        assert_eq!(value["name"], "beers");
        assert_eq!(value["development"], true);
        assert!(value.get("password").is_none());
    }

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), RequestState::Created);
        assert!(cell.advance(RequestState::Dispatched));
        assert!(cell.advance(RequestState::Completed));
        assert_eq!(cell.get(), RequestState::Completed);
        assert!(cell.get().is_terminal());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "request resolved twice")]
    fn test_leaving_terminal_state_asserts_in_debug() {
        let cell = StateCell::new();
        assert!(cell.advance(RequestState::Completed));
        cell.advance(RequestState::Failed);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_leaving_terminal_state_is_ignored_in_release() {
        let cell = StateCell::new();
        assert!(cell.advance(RequestState::Completed));
        assert!(!cell.advance(RequestState::Failed));
        assert!(!cell.advance(RequestState::Dispatched));
        assert_eq!(cell.get(), RequestState::Completed);
    }
}
