// tun-test-utils: Shared test doubles for the dispatch suite.
//
// Provides an in-memory connection registry that records every frame, a
// recording response sink for executor assertions, trace-appending handlers,
// and a framed in-memory transport pair.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tun_dispatch::{
    CommandContext, CommandDirection, CommandHandler, ConnectionRegistry, DispatchError,
    PacketSink, ResponseSink,
};
use tun_protocol::{
    CommandResponse, CommandType, FramedReader, FramedWriter, TransferPacket,
};

// ---------------------------------------------------------------------------
// Mock connections
// ---------------------------------------------------------------------------

/// The outgoing half of a mock connection; every frame is recorded.
#[derive(Default)]
pub struct MockSink {
    sent: Mutex<Vec<TransferPacket>>,
    fail_sends: AtomicBool,
}

impl MockSink {
    pub fn sent(&self) -> Vec<TransferPacket> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_responses(&self) -> Vec<CommandResponse> {
        self.sent()
            .into_iter()
            .filter_map(|packet| match packet {
                TransferPacket::Response(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    /// Makes every subsequent send fail with `StreamUnavailable`.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PacketSink for MockSink {
    async fn send_packet(&self, packet: &TransferPacket) -> Result<(), DispatchError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DispatchError::StreamUnavailable("mock".to_owned()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet.clone());
        Ok(())
    }
}

/// In-memory connection registry.
#[derive(Default)]
pub struct MockConnections {
    connections: Mutex<HashMap<String, Arc<MockSink>>>,
}

impl MockConnections {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Registers a connection and returns its recording sink.
    pub fn add(&self, connection_id: &str) -> Arc<MockSink> {
        let sink = Arc::new(MockSink::default());
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_owned(), Arc::clone(&sink));
        sink
    }

    pub fn remove(&self, connection_id: &str) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
    }
}

impl ConnectionRegistry for MockConnections {
    fn lookup(&self, connection_id: &str) -> Option<Arc<dyn PacketSink>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
            .map(|sink| sink as Arc<dyn PacketSink>)
    }
}

/// A `ResponseSink` that records deliveries instead of writing frames.
#[derive(Default)]
pub struct RecordingResponseSink {
    responses: Mutex<Vec<(String, CommandResponse)>>,
    fail_sends: AtomicBool,
}

impl RecordingResponseSink {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn responses(&self) -> Vec<(String, CommandResponse)> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResponseSink for RecordingResponseSink {
    async fn send_response(
        &self,
        connection_id: &str,
        response: &CommandResponse,
    ) -> Result<(), DispatchError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DispatchError::ConnectionNotFound(connection_id.to_owned()));
        }
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((connection_id.to_owned(), response.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording handler
// ---------------------------------------------------------------------------

pub type Trace = Arc<Mutex<Vec<String>>>;

/// A handler that appends its name to a shared trace and returns a fixed
/// outcome.
pub struct RecordingHandler {
    command_type: CommandType,
    direction: CommandDirection,
    name: String,
    trace: Trace,
    data: Option<String>,
    error: Option<String>,
}

impl RecordingHandler {
    pub fn new(command_type: CommandType, direction: CommandDirection, trace: Trace) -> Self {
        RecordingHandler {
            command_type,
            direction,
            name: "recording".to_owned(),
            trace,
            data: None,
            error: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The JSON data the success envelope will carry.
    pub fn returning(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Makes every invocation fail with the given message.
    pub fn failing(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    fn command_type(&self) -> CommandType {
        self.command_type
    }

    fn direction(&self) -> CommandDirection {
        self.direction
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &mut CommandContext) -> Result<CommandResponse, DispatchError> {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.name.clone());
        match &self.error {
            Some(error) => Err(DispatchError::handler(error.clone())),
            None => Ok(CommandResponse::ok(self.data.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory framed transport
// ---------------------------------------------------------------------------

/// One endpoint of an in-memory framed connection.
pub struct FramedEndpoint {
    pub reader: FramedReader<ReadHalf<DuplexStream>>,
    pub writer: FramedWriter<WriteHalf<DuplexStream>>,
}

/// Builds two connected endpoints, as if a client and server shared a TCP
/// stream.
pub fn framed_pair() -> (FramedEndpoint, FramedEndpoint) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        FramedEndpoint {
            reader: FramedReader::new(left_read),
            writer: FramedWriter::new(left_write),
        },
        FramedEndpoint {
            reader: FramedReader::new(right_read),
            writer: FramedWriter::new(right_write),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tun_protocol::CommandPacket;

    #[tokio::test]
    async fn mock_sink_records_frames_in_order() {
        let connections = MockConnections::new();
        let sink = connections.add("conn-1");

        let outgoing = connections.lookup("conn-1").unwrap();
        outgoing
            .send_packet(&TransferPacket::Heartbeat)
            .await
            .unwrap();
        outgoing
            .send_packet(&TransferPacket::Command(CommandPacket::default()))
            .await
            .unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], TransferPacket::Heartbeat);
    }

    #[tokio::test]
    async fn lookup_reports_absence_unambiguously() {
        let connections = MockConnections::new();
        assert!(connections.lookup("conn-missing").is_none());

        connections.add("conn-1");
        connections.remove("conn-1");
        assert!(connections.lookup("conn-1").is_none());
    }

    #[tokio::test]
    async fn failing_sink_surfaces_stream_unavailable() {
        let connections = MockConnections::new();
        let sink = connections.add("conn-1");
        sink.fail_sends(true);

        let outgoing = connections.lookup("conn-1").unwrap();
        let result = outgoing.send_packet(&TransferPacket::Heartbeat).await;
        assert!(matches!(result, Err(DispatchError::StreamUnavailable(_))));
    }

    #[tokio::test]
    async fn framed_pair_carries_frames_both_ways() {
        let (mut client, mut server) = framed_pair();

        client
            .writer
            .write_packet(&TransferPacket::Heartbeat, false)
            .await
            .unwrap();
        let got = server.reader.read_packet().await.unwrap().unwrap();
        assert_eq!(got, TransferPacket::Heartbeat);

        server
            .writer
            .write_packet(&TransferPacket::Heartbeat, false)
            .await
            .unwrap();
        let got = client.reader.read_packet().await.unwrap().unwrap();
        assert_eq!(got, TransferPacket::Heartbeat);
    }
}
