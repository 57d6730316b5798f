//! Transport seam between endpoints and the network
//!
//! An endpoint does not know how bytes reach the service. It asks a
//! [`Connector`] for a [`Link`], hands outbound [`Frame`]s to the link, and
//! receives responses through the [`ResponseHandler`] it passed in when
//! connecting.
//!
//! - [`memory`]: in-process transport for tests and simulations
//! - [`tcp`]: TCP transport using the length-prefixed frames of [`codec`]

pub mod codec;
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::request::{RequestError, RequestId};
use crate::service::ServiceType;

pub use memory::{Inbound, MemoryConnector, MemoryServer};
pub use tcp::TcpConnector;

/// Outbound request as seen by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: RequestId,
    pub service: ServiceType,
    pub payload: Bytes,
}

/// Error types for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Link is closed")]
    LinkClosed,

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::LinkClosed => RequestError::ConnectionClosed,
            TransportError::Malformed(reason) => RequestError::Encode(reason),
            other => RequestError::Connection(other.to_string()),
        }
    }
}

/// Receives what comes back over a link
///
/// Transports call these from their own tasks, never from inside
/// [`Link::transmit`].
pub trait ResponseHandler: Send + Sync {
    /// A response (or service-level error) for correlation id `id`
    fn on_response(&self, id: RequestId, outcome: Result<Bytes, RequestError>);

    /// The remote side closed the link or it failed
    fn on_closed(&self);
}

/// Opens links to a service on a node
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        service: ServiceType,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<dyn Link>, TransportError>;
}

/// One open connection
pub trait Link: Send + Sync {
    /// Hand a frame to the transport without waiting for it to be written
    fn transmit(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the link; no handler callbacks follow
    fn close(&self);
}
