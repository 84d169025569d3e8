use crate::error::DispatchError;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tun_protocol::{CommandPacket, CommandType};

/// Per-execution state for one incoming command.
///
/// Created from a decoded packet when the session routes it to the executor,
/// owned by exactly one execution.  Middleware may mutate the identity
/// fields (`is_authenticated`, `user_id`) before the handler runs.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub connection_id: String,
    pub command_type: CommandType,
    pub command_id: String,
    /// Correlation key for the duplex path; stamped by the executor.
    pub request_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub client_id: String,
    /// Handler-specific JSON document, as received on the wire.
    pub request_body: String,
    /// Derived per execution; handlers must abort blocking work when this
    /// token fires.
    pub cancel: CancellationToken,
    pub is_authenticated: bool,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl CommandContext {
    /// Builds the context for one incoming packet.  Authentication state
    /// starts cleared; middleware may override it.
    pub fn from_packet(
        connection_id: impl Into<String>,
        packet: &CommandPacket,
        cancel: CancellationToken,
    ) -> Self {
        CommandContext {
            connection_id: connection_id.into(),
            command_type: packet.command_type,
            command_id: packet.command_id.clone(),
            request_id: packet.token.clone(),
            sender_id: packet.sender_id.clone(),
            receiver_id: packet.receiver_id.clone(),
            client_id: packet.sender_id.clone(),
            request_body: packet.command_body.clone(),
            cancel,
            is_authenticated: false,
            user_id: String::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Structural validity: a context must name a connection and carry a
    /// registered-able command type.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.connection_id.is_empty() {
            return Err(DispatchError::InvalidParam(
                "context has no connection id".to_owned(),
            ));
        }
        if self.command_type == CommandType::Unknown {
            return Err(DispatchError::InvalidCommandType);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> CommandPacket {
        CommandPacket {
            command_type: CommandType::Connect,
            command_id: "cmd_1_connA".to_owned(),
            token: "t1".to_owned(),
            sender_id: "client-1".to_owned(),
            receiver_id: "control".to_owned(),
            command_body: "{}".to_owned(),
        }
    }

    #[test]
    fn from_packet_starts_unauthenticated() {
        let ctx = CommandContext::from_packet("conn-1", &packet(), CancellationToken::new());
        assert!(!ctx.is_authenticated);
        assert!(ctx.user_id.is_empty());
        assert_eq!(ctx.request_id, "t1");
        assert_eq!(ctx.client_id, "client-1");
        assert!(ctx.end_time.is_none());
    }

    #[test]
    fn validate_rejects_missing_connection_and_unknown_type() {
        let mut ctx = CommandContext::from_packet("conn-1", &packet(), CancellationToken::new());
        assert!(ctx.validate().is_ok());

        ctx.connection_id.clear();
        assert!(matches!(
            ctx.validate(),
            Err(DispatchError::InvalidParam(_))
        ));

        let mut ctx = CommandContext::from_packet("conn-1", &packet(), CancellationToken::new());
        ctx.command_type = CommandType::Unknown;
        assert!(matches!(
            ctx.validate(),
            Err(DispatchError::InvalidCommandType)
        ));
    }
}
