//! Tracing boundary
//!
//! Requests carry an explicit span capability instead of reaching for ambient
//! tracing state. When a span is attached, the request writes a single
//! `peer.service` tag naming the target service. With tracing disabled the
//! [`NoopSpan`] keeps the code path identical.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::request::RequestId;
use crate::service::ServiceType;

/// Tag key identifying the remote service of a span
pub const PEER_SERVICE: &str = "peer.service";

/// Minimal span capability used at dispatch time
///
/// Implementations must not block and must not fail.
pub trait SpanTag: Send + Sync {
    fn set_tag(&self, key: &'static str, value: &str);
}

/// Shared handle to a span capability
pub type SharedSpan = Arc<dyn SpanTag>;

/// Span capability used when tracing is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpan;

impl SpanTag for NoopSpan {
    fn set_tag(&self, _key: &'static str, _value: &str) {}
}

impl SpanTag for tracing::Span {
    fn set_tag(&self, key: &'static str, value: &str) {
        // Only fields declared when the span was created are recorded.
        self.record(key, value);
    }
}

/// Span that keeps its tags in memory
#[derive(Debug, Default)]
pub struct MemorySpan {
    tags: Mutex<Vec<(&'static str, String)>>,
}

impl MemorySpan {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tags in the order they were set
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        self.tags.lock().clone()
    }

    /// Last value written for `key`
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }
}

impl SpanTag for MemorySpan {
    fn set_tag(&self, key: &'static str, value: &str) {
        self.tags.lock().push((key, value.to_string()));
    }
}

/// A `tracing` span for one dispatch, with `peer.service` declared but empty
pub fn dispatch_span(service: ServiceType, id: RequestId) -> tracing::Span {
    tracing::info_span!(
        "dispatch",
        request_id = %id,
        service = %service,
        peer.service = tracing::field::Empty
    )
}
