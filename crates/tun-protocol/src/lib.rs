// tun-protocol: Control-plane wire types and packet framing.
//
// Every control connection carries a stream of frames:
//
// ```text
// | packet type (1B) | body length (4B BE) | body (NB) |
// ```
//
// Heartbeat frames are the type byte alone.  The body of a command or
// response frame is a JSON document (optionally gzip-compressed, signalled
// by the high bit of the type byte).  The JSON field names below are frozen;
// peers in other languages parse them byte-for-byte.

use serde::{Deserialize, Serialize};

pub mod framing;

pub use framing::{FramedReader, FramedWriter, RateLimiter};

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Integer tag identifying the kind of operation a command packet carries.
///
/// Tag 0 is reserved for "unknown/default" and is invalid for handler
/// registration.  Tags are grouped in decades by family; the family decides
/// the [`CommandCategory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CommandType {
    #[default]
    Unknown = 0,
    // Connection lifecycle
    Connect = 1,
    Disconnect = 2,
    Reconnect = 3,
    // TCP port mapping CRUD
    TcpMapCreate = 10,
    TcpMapUpdate = 11,
    TcpMapDelete = 12,
    TcpMapList = 13,
    // HTTP port mapping CRUD
    HttpMapCreate = 20,
    HttpMapUpdate = 21,
    HttpMapDelete = 22,
    HttpMapList = 23,
    // SOCKS port mapping CRUD
    SocksMapCreate = 30,
    SocksMapUpdate = 31,
    SocksMapDelete = 32,
    SocksMapList = 33,
    // Data transfer
    TransferStart = 40,
    TransferStop = 41,
    TransferStatus = 42,
    DataForward = 43,
    // Management
    Management = 50,
    // RPC
    RpcInvoke = 60,
    // Notification
    Notify = 70,
    // HTTP domain mapping
    DomainMapRegister = 80,
    DomainMapRelease = 81,
    // DNS
    DnsResolve = 90,
}

/// Command family, inferred from the tag decade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    Unknown,
    Lifecycle,
    PortMapping,
    Transfer,
    Management,
    Rpc,
    Notification,
    DomainMapping,
    Dns,
}

impl CommandType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a wire tag back to a known command type.  Unrecognized tags
    /// collapse to [`CommandType::Unknown`] and are rejected at dispatch
    /// with `HandlerNotRegistered`.
    pub fn from_i32(tag: i32) -> Self {
        match tag {
            1 => Self::Connect,
            2 => Self::Disconnect,
            3 => Self::Reconnect,
            10 => Self::TcpMapCreate,
            11 => Self::TcpMapUpdate,
            12 => Self::TcpMapDelete,
            13 => Self::TcpMapList,
            20 => Self::HttpMapCreate,
            21 => Self::HttpMapUpdate,
            22 => Self::HttpMapDelete,
            23 => Self::HttpMapList,
            30 => Self::SocksMapCreate,
            31 => Self::SocksMapUpdate,
            32 => Self::SocksMapDelete,
            33 => Self::SocksMapList,
            40 => Self::TransferStart,
            41 => Self::TransferStop,
            42 => Self::TransferStatus,
            43 => Self::DataForward,
            50 => Self::Management,
            60 => Self::RpcInvoke,
            70 => Self::Notify,
            80 => Self::DomainMapRegister,
            81 => Self::DomainMapRelease,
            90 => Self::DnsResolve,
            _ => Self::Unknown,
        }
    }

    pub fn category(self) -> CommandCategory {
        match self.as_i32() {
            1..=9 => CommandCategory::Lifecycle,
            10..=39 => CommandCategory::PortMapping,
            40..=49 => CommandCategory::Transfer,
            50..=59 => CommandCategory::Management,
            60..=69 => CommandCategory::Rpc,
            70..=79 => CommandCategory::Notification,
            80..=89 => CommandCategory::DomainMapping,
            90..=99 => CommandCategory::Dns,
            _ => CommandCategory::Unknown,
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

// On the wire a command type is its bare integer tag.
impl Serialize for CommandType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for CommandType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = i32::deserialize(deserializer)?;
        Ok(Self::from_i32(tag))
    }
}

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

/// Frame kind, after masking off the compressed bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Heartbeat,
    JsonCommand,
    CommandResponse,
}

/// The leading byte of every frame.  Low bits identify the kind; the high
/// bit marks the body as gzip-compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketType(u8);

impl PacketType {
    pub const HEARTBEAT: PacketType = PacketType(0x01);
    pub const JSON_COMMAND: PacketType = PacketType(0x02);
    pub const COMMAND_RESPONSE: PacketType = PacketType(0x03);

    pub const COMPRESSED_BIT: u8 = 0x80;

    pub fn from_byte(byte: u8) -> Self {
        PacketType(byte)
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn kind(self) -> Result<PacketKind, ProtocolError> {
        match self.0 & !Self::COMPRESSED_BIT {
            0x01 => Ok(PacketKind::Heartbeat),
            0x02 => Ok(PacketKind::JsonCommand),
            0x03 => Ok(PacketKind::CommandResponse),
            _ => Err(ProtocolError::UnknownPacketType(self.0)),
        }
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED_BIT != 0
    }

    pub fn compressed(self) -> Self {
        PacketType(self.0 | Self::COMPRESSED_BIT)
    }
}

// ---------------------------------------------------------------------------
// Command packet
// ---------------------------------------------------------------------------

/// A framed command as it appears on the wire.
///
/// `command_id` is client-assigned and used for replay protection; `token`
/// is the server-side correlation key (request id) for duplex exchanges.
/// `command_body` is itself a JSON document whose schema is handler-specific.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub command_type: CommandType,
    pub command_id: String,
    pub token: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub command_body: String,
}

/// The response envelope written back for duplex commands.
///
/// `success` holds iff `error` is empty.  `data` may be empty for oneway
/// acknowledgements.  `processing_time` is nanoseconds spent in the
/// handler pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub data: Option<String>,
    pub error: String,
    pub request_id: String,
    pub command_id: String,
    pub processing_time: i64,
    pub handler_name: String,
}

impl CommandResponse {
    /// A successful envelope; `error` stays empty.
    pub fn ok(data: Option<String>) -> Self {
        CommandResponse {
            success: true,
            data,
            error: String::new(),
            request_id: String::new(),
            command_id: String::new(),
            processing_time: 0,
            handler_name: String::new(),
        }
    }

    /// A failed envelope carrying the handler's error text.
    pub fn err(error: impl Into<String>) -> Self {
        CommandResponse {
            success: false,
            data: None,
            error: error.into(),
            request_id: String::new(),
            command_id: String::new(),
            processing_time: 0,
            handler_name: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer packet
// ---------------------------------------------------------------------------

/// One decoded frame.  Heartbeats carry no body.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferPacket {
    Heartbeat,
    Command(CommandPacket),
    Response(CommandResponse),
}

impl TransferPacket {
    /// The uncompressed packet type for this frame.
    pub fn packet_type(&self) -> PacketType {
        match self {
            TransferPacket::Heartbeat => PacketType::HEARTBEAT,
            TransferPacket::Command(_) => PacketType::JSON_COMMAND,
            TransferPacket::Response(_) => PacketType::COMMAND_RESPONSE,
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Framing failures.  Read/write failures surface as `Io`; a peer closing
/// mid-frame is `UnexpectedEof`; malformed JSON bodies are `Json`.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended mid-frame")]
    UnexpectedEof,
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("heartbeat frames must not set the compressed bit")]
    CompressedHeartbeat,
    #[error("frame body of {got} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { got: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_round_trips_through_tag() {
        for ty in [
            CommandType::Connect,
            CommandType::TcpMapCreate,
            CommandType::HttpMapList,
            CommandType::SocksMapDelete,
            CommandType::DataForward,
            CommandType::Management,
            CommandType::RpcInvoke,
            CommandType::Notify,
            CommandType::DomainMapRegister,
            CommandType::DnsResolve,
        ] {
            assert_eq!(CommandType::from_i32(ty.as_i32()), ty);
        }
    }

    #[test]
    fn unrecognized_tag_collapses_to_unknown() {
        assert_eq!(CommandType::from_i32(0), CommandType::Unknown);
        assert_eq!(CommandType::from_i32(999), CommandType::Unknown);
        assert_eq!(CommandType::from_i32(-7), CommandType::Unknown);
    }

    #[test]
    fn categories_follow_tag_decades() {
        assert_eq!(CommandType::Connect.category(), CommandCategory::Lifecycle);
        assert_eq!(
            CommandType::SocksMapList.category(),
            CommandCategory::PortMapping
        );
        assert_eq!(
            CommandType::TransferStatus.category(),
            CommandCategory::Transfer
        );
        assert_eq!(CommandType::RpcInvoke.category(), CommandCategory::Rpc);
        assert_eq!(
            CommandType::DomainMapRelease.category(),
            CommandCategory::DomainMapping
        );
        assert_eq!(CommandType::DnsResolve.category(), CommandCategory::Dns);
        assert_eq!(CommandType::Unknown.category(), CommandCategory::Unknown);
    }

    #[test]
    fn command_type_serializes_as_bare_integer() {
        let json = serde_json::to_string(&CommandType::TcpMapCreate).unwrap();
        assert_eq!(json, "10");
        let back: CommandType = serde_json::from_str("10").unwrap();
        assert_eq!(back, CommandType::TcpMapCreate);
    }

    #[test]
    fn packet_type_compressed_bit() {
        let ty = PacketType::JSON_COMMAND;
        assert!(!ty.is_compressed());
        let compressed = ty.compressed();
        assert!(compressed.is_compressed());
        assert_eq!(compressed.kind().unwrap(), PacketKind::JsonCommand);
        assert_eq!(ty.kind().unwrap(), PacketKind::JsonCommand);
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        assert!(matches!(
            PacketType::from_byte(0x7f).kind(),
            Err(ProtocolError::UnknownPacketType(0x7f))
        ));
    }

    #[test]
    fn response_constructors_keep_success_error_exclusive() {
        let ok = CommandResponse::ok(Some("{}".to_owned()));
        assert!(ok.success);
        assert!(ok.error.is_empty());

        let err = CommandResponse::err("boom");
        assert!(!err.success);
        assert_eq!(err.error, "boom");
        assert!(err.data.is_none());
    }
}
