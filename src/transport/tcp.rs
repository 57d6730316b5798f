//! TCP transport
//!
//! One TCP connection per link. A writer task drains an unbounded queue of
//! frames into the socket so that [`Link::transmit`] never waits on I/O; a
//! reader task decodes response frames and hands them to the endpoint's
//! [`ResponseHandler`].

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{codec, Connector, Frame, Link, ResponseHandler, TransportError};
use crate::request::RequestError;
use crate::service::ServiceType;

/// Connector opening plain TCP links
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open_stream(&self, address: &str) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        stream.set_nodelay(true)?;

        // Configure TCP keep-alive
        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        Ok(TcpStream::from_std(socket.into())?)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        service: ServiceType,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let stream = self.open_stream(address).await?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(write_half, rx, address.to_string()));
        let reader = tokio::spawn(read_loop(read_half, handler, address.to_string()));

        info!(address = %address, service = %service, "TCP link established");

        Ok(Arc::new(TcpLink { tx, reader, writer }))
    }
}

struct TcpLink {
    tx: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link for TcpLink {
    fn transmit(&self, frame: Frame) -> Result<(), TransportError> {
        codec::check_payload_len(frame.payload.len())?;
        self.tx.send(frame).map_err(|_| TransportError::LinkClosed)
    }

    fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    address: String,
) {
    let mut buf = BytesMut::with_capacity(4096);
    while let Some(frame) = rx.recv().await {
        buf.clear();
        if let Err(e) = codec::encode_request(&frame, &mut buf) {
            warn!(address = %address, request_id = %frame.id, error = %e, "dropping unencodable frame");
            continue;
        }
        if let Err(e) = half.write_all(&buf).await {
            warn!(address = %address, error = %e, "TCP write failed");
            break;
        }
    }
    let _ = half.shutdown().await;
}

async fn read_loop(mut half: OwnedReadHalf, handler: Arc<dyn ResponseHandler>, address: String) {
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        match codec::decode_response(&mut buf) {
            Ok(Some(frame)) => {
                handler.on_response(frame.id, frame.outcome.map_err(RequestError::Service));
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(address = %address, error = %e, "dropping TCP link after bad frame");
                break;
            }
        }

        match half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(address = %address, "TCP link closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(address = %address, error = %e, "TCP read failed");
                break;
            }
        }
    }
    handler.on_closed();
}
