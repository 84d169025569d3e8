//! Session collaborator contracts.
//!
//! The session layer owns the sockets: it is the sole packet router on the
//! read side and the only component that can resolve a connection id to an
//! outgoing stream.  The dispatch core consumes these two seams and nothing
//! else, so tests can assert delivery without a live session.

use crate::error::DispatchError;
use async_trait::async_trait;
use std::sync::Arc;
use tun_protocol::{CommandResponse, TransferPacket};

/// The outgoing half of one connection.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Writes one frame.  `StreamUnavailable` when the underlying stream is
    /// gone but the connection entry still exists.
    async fn send_packet(&self, packet: &TransferPacket) -> Result<(), DispatchError>;
}

/// Connection lookup by id; absence is reported unambiguously as `None`.
pub trait ConnectionRegistry: Send + Sync {
    fn lookup(&self, connection_id: &str) -> Option<Arc<dyn PacketSink>>;
}

/// Where the executor writes duplex responses.
///
/// Injected so the executor never reaches into a concrete session; a test
/// sink records responses instead of writing frames.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send_response(
        &self,
        connection_id: &str,
        response: &CommandResponse,
    ) -> Result<(), DispatchError>;
}

/// Routes responses through the session's connection lookup.
pub struct SessionResponseSink {
    connections: Arc<dyn ConnectionRegistry>,
}

impl SessionResponseSink {
    pub fn new(connections: Arc<dyn ConnectionRegistry>) -> Self {
        SessionResponseSink { connections }
    }
}

#[async_trait]
impl ResponseSink for SessionResponseSink {
    async fn send_response(
        &self,
        connection_id: &str,
        response: &CommandResponse,
    ) -> Result<(), DispatchError> {
        let sink = self
            .connections
            .lookup(connection_id)
            .ok_or_else(|| DispatchError::ConnectionNotFound(connection_id.to_owned()))?;
        sink.send_packet(&TransferPacket::Response(response.clone()))
            .await
    }
}
