use tun_protocol::{CommandType, ProtocolError};

/// The error surface of the dispatch core.
///
/// Framing and correlator errors propagate to callers verbatim.  Handler
/// errors on the duplex path are serialised into a `success=false` envelope
/// for the peer and surface locally as [`DispatchError::CommandExecutionFailed`];
/// on the oneway path they are logged and absorbed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("command type 0 is reserved and cannot be registered")]
    InvalidCommandType,
    #[error("a handler for {0} is already registered")]
    DuplicateHandler(CommandType),
    #[error("no handler registered for {0}")]
    HandlerNotRegistered(CommandType),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("network: {0}")]
    Network(#[from] ProtocolError),
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("stream unavailable for connection {0}")]
    StreamUnavailable(String),
    #[error("service is closed")]
    ServiceClosed,
    #[error("command execution failed: {0}")]
    CommandExecutionFailed(String),
    #[error("command id already used within the replay window: {0}")]
    ReplayRejected(String),
    #[error("malformed command id: {0}")]
    CommandIdMalformed(String),
    /// A business handler's own failure, carried as bare text so the peer
    /// sees exactly what the handler said.
    #[error("{0}")]
    Handler(String),
}

impl DispatchError {
    pub fn handler(message: impl Into<String>) -> Self {
        DispatchError::Handler(message.into())
    }

    /// Default retryability classification used by the retry middleware.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Network(_) | DispatchError::Timeout)
    }
}
