//! Typed command client.
//!
//! A fluent builder that serialises a typed request, writes a command frame
//! through the session's connection lookup and awaits the typed response.
//! The client never reads the stream itself: the session's read task is the
//! sole reader and delivers responses through the correlator, keyed by
//! request id.
//!
//! A cancellation token is mandatory for response-awaiting calls so that
//! shutdown never leaves a waiter behind.

use crate::correlator::RpcCorrelator;
use crate::error::DispatchError;
use crate::ids;
use crate::session::ConnectionRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tun_protocol::{CommandPacket, CommandType, TransferPacket};

type ErrorMapper = Box<dyn Fn(DispatchError) -> DispatchError + Send + Sync>;

pub struct CommandClient<Req, Resp> {
    connections: Arc<dyn ConnectionRegistry>,
    correlator: Arc<RpcCorrelator>,
    command_type: Option<CommandType>,
    connection_id: Option<String>,
    request_id: Option<String>,
    command_id: Option<String>,
    sender_id: String,
    receiver_id: String,
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
    authenticated: bool,
    user_id: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    request: Option<Req>,
    expect_response: bool,
    map_error: Option<ErrorMapper>,
    _response: PhantomData<fn() -> Resp>,
}

impl<Req, Resp> CommandClient<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    pub fn new(connections: Arc<dyn ConnectionRegistry>, correlator: Arc<RpcCorrelator>) -> Self {
        CommandClient {
            connections,
            correlator,
            command_type: None,
            connection_id: None,
            request_id: None,
            command_id: None,
            sender_id: String::new(),
            receiver_id: String::new(),
            cancel: None,
            timeout: None,
            authenticated: false,
            user_id: String::new(),
            start_time: None,
            end_time: None,
            request: None,
            expect_response: false,
            map_error: None,
            _response: PhantomData,
        }
    }

    pub fn command(mut self, command_type: CommandType) -> Self {
        self.command_type = Some(command_type);
        self
    }

    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn receiver_id(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = receiver_id.into();
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Attaches the request payload, serialised to JSON at execute time.
    pub fn request(mut self, request: Req) -> Self {
        self.request = Some(request);
        self
    }

    /// Declares that the caller wants the typed response; without this the
    /// call is fire-and-forget.
    pub fn expect_response(mut self) -> Self {
        self.expect_response = true;
        self
    }

    /// Maps every error this call produces, e.g. onto a domain error.
    pub fn map_error_with(
        mut self,
        mapper: impl Fn(DispatchError) -> DispatchError + Send + Sync + 'static,
    ) -> Self {
        self.map_error = Some(Box::new(mapper));
        self
    }

    /// Sends the command and, when a response is expected, awaits it.
    ///
    /// Returns `Ok(None)` for fire-and-forget calls and for responses that
    /// carry no data.
    pub async fn execute(mut self) -> Result<Option<Resp>, DispatchError> {
        let mapper = self.map_error.take();
        let result = self.execute_inner().await;
        match (result, mapper) {
            (Err(error), Some(mapper)) => Err(mapper(error)),
            (result, _) => result,
        }
    }

    /// Spawns `execute` and hands back a one-shot receiver for its outcome.
    pub fn execute_detached(self) -> oneshot::Receiver<Result<Option<Resp>, DispatchError>> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(self.execute().await);
        });
        rx
    }

    async fn execute_inner(self) -> Result<Option<Resp>, DispatchError> {
        let command_type = self
            .command_type
            .filter(|ty| *ty != CommandType::Unknown)
            .ok_or_else(|| DispatchError::InvalidParam("command type not set".to_owned()))?;
        let connection_id = self
            .connection_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DispatchError::InvalidParam("connection id not set".to_owned()))?;

        let command_id = self
            .command_id
            .unwrap_or_else(|| ids::command_id(&connection_id));
        let start_time = self.start_time.unwrap_or_else(Utc::now);
        let request_id = self.request_id.unwrap_or_else(ids::request_id);

        let command_body = match &self.request {
            Some(request) => serde_json::to_string(request)
                .map_err(|e| DispatchError::InvalidData(format!("request serialization: {e}")))?,
            None => String::new(),
        };

        let sink = self
            .connections
            .lookup(&connection_id)
            .ok_or_else(|| DispatchError::ConnectionNotFound(connection_id.clone()))?;

        let packet = CommandPacket {
            command_type,
            command_id: command_id.clone(),
            token: request_id.clone(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            command_body,
        };

        if !self.expect_response {
            return sink
                .send_packet(&TransferPacket::Command(packet))
                .await
                .map(|()| None);
        }

        // Response-awaiting calls must be cancellable on shutdown.
        let cancel = self.cancel.ok_or_else(|| {
            DispatchError::InvalidParam(
                "a cancellation token is required when awaiting a response".to_owned(),
            )
        })?;

        let rx = self.correlator.register(&request_id);
        if let Err(error) = sink.send_packet(&TransferPacket::Command(packet)).await {
            self.correlator.unregister(&request_id);
            return Err(error);
        }

        let deadline = self.timeout.unwrap_or_else(|| self.correlator.timeout());
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.correlator.unregister(&request_id);
                return Err(DispatchError::Timeout);
            }
            outcome = tokio::time::timeout(deadline, rx) => {
                self.correlator.unregister(&request_id);
                match outcome {
                    Err(_) => return Err(DispatchError::Timeout),
                    Ok(Err(_)) => return Err(DispatchError::Timeout),
                    Ok(Ok(response)) => response,
                }
            }
        };

        // The token match is authoritative; a command-id mismatch is a peer
        // anomaly worth noting, not a reason to discard the reply.
        if !response.command_id.is_empty() && response.command_id != command_id {
            warn!(
                expected = %command_id,
                got = %response.command_id,
                request_id = %request_id,
                "response command id does not match the request"
            );
        }

        let end_time = self.end_time.unwrap_or_else(Utc::now);
        debug!(
            request_id = %request_id,
            authenticated = self.authenticated,
            user_id = %self.user_id,
            elapsed_ms = (end_time - start_time).num_milliseconds(),
            "command round trip completed"
        );

        if !response.success {
            return Err(DispatchError::CommandExecutionFailed(response.error));
        }

        match response.data.as_deref() {
            None | Some("") => Ok(None),
            Some(data) => serde_json::from_str(data)
                .map(Some)
                .map_err(|e| DispatchError::InvalidData(format!("response deserialization: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Oneway variant
// ---------------------------------------------------------------------------

/// Fire-and-forget client: no typed request, no response await.
///
/// Follows the same validation and framing rules as [`CommandClient`];
/// the body, when present, is a raw JSON document.
pub struct OnewayCommandClient {
    connections: Arc<dyn ConnectionRegistry>,
    command_type: Option<CommandType>,
    connection_id: Option<String>,
    command_id: Option<String>,
    sender_id: String,
    receiver_id: String,
    body: String,
}

impl OnewayCommandClient {
    pub fn new(connections: Arc<dyn ConnectionRegistry>) -> Self {
        OnewayCommandClient {
            connections,
            command_type: None,
            connection_id: None,
            command_id: None,
            sender_id: String::new(),
            receiver_id: String::new(),
            body: String::new(),
        }
    }

    pub fn command(mut self, command_type: CommandType) -> Self {
        self.command_type = Some(command_type);
        self
    }

    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn sender_id(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn receiver_id(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = receiver_id.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub async fn send(self) -> Result<(), DispatchError> {
        let command_type = self
            .command_type
            .filter(|ty| *ty != CommandType::Unknown)
            .ok_or_else(|| DispatchError::InvalidParam("command type not set".to_owned()))?;
        let connection_id = self
            .connection_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DispatchError::InvalidParam("connection id not set".to_owned()))?;

        let sink = self
            .connections
            .lookup(&connection_id)
            .ok_or_else(|| DispatchError::ConnectionNotFound(connection_id.clone()))?;

        let packet = CommandPacket {
            command_type,
            command_id: self
                .command_id
                .unwrap_or_else(|| ids::command_id(&connection_id)),
            token: String::new(),
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            command_body: self.body,
        };
        sink.send_packet(&TransferPacket::Command(packet)).await
    }
}
