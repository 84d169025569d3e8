//! Packet framing over a byte stream.
//!
//! One direction per framer half: a connection's read task owns a
//! [`FramedReader`], its write task owns a [`FramedWriter`].  Frame layout:
//!
//! ```text
//! | type (1B) | body length (4B BE) | body (NB) |
//! ```
//!
//! Heartbeat frames consist of the type byte only.  When the compressed bit
//! is set on a command/response frame, the body is gzip-compressed and the
//! length prefix covers the compressed bytes.
//!
//! Writes may be rate limited: body bytes go out in chunks at the budgeted
//! rate, while the 5-byte header is always charged and written whole.

use crate::{
    CommandPacket, CommandResponse, PacketKind, PacketType, ProtocolError, TransferPacket,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Default cap on a single frame body.  Oversized peers are cut off rather
/// than buffered.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Type byte plus the big-endian length prefix.
const HEADER_BYTES: usize = 5;

/// Rate-limited body writes go out in chunks of this size.
const WRITE_CHUNK_BYTES: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Reader half
// ---------------------------------------------------------------------------

/// Decodes frames from an `AsyncRead`.
pub struct FramedReader<R> {
    inner: R,
    max_body: usize,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        FramedReader {
            inner,
            max_body: MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body(inner: R, max_body: usize) -> Self {
        FramedReader { inner, max_body }
    }

    /// Reads one frame.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between frames.  A
    /// close after the type byte but before the body completes is
    /// [`ProtocolError::UnexpectedEof`].
    pub async fn read_packet(&mut self) -> Result<Option<TransferPacket>, ProtocolError> {
        let mut type_buf = [0u8; 1];
        match self.inner.read_exact(&mut type_buf).await {
            Ok(_) => {}
            // EOF at a frame boundary is a normal close, not an error.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ProtocolError::Io(e)),
        }

        let packet_type = PacketType::from_byte(type_buf[0]);
        let kind = packet_type.kind()?;

        if kind == PacketKind::Heartbeat {
            if packet_type.is_compressed() {
                return Err(ProtocolError::CompressedHeartbeat);
            }
            return Ok(Some(TransferPacket::Heartbeat));
        }

        let mut len_buf = BytesMut::zeroed(4);
        self.read_exact_or_eof(&mut len_buf).await?;
        let body_len = len_buf.get_u32() as usize;
        if body_len > self.max_body {
            return Err(ProtocolError::FrameTooLarge {
                got: body_len,
                limit: self.max_body,
            });
        }

        let mut body = BytesMut::zeroed(body_len);
        self.read_exact_or_eof(&mut body).await?;

        let body: Bytes = if packet_type.is_compressed() {
            gzip_decompress(&body)?
        } else {
            body.freeze()
        };

        let packet = match kind {
            PacketKind::JsonCommand => {
                if body.is_empty() {
                    TransferPacket::Command(CommandPacket::default())
                } else {
                    TransferPacket::Command(serde_json::from_slice(&body)?)
                }
            }
            PacketKind::CommandResponse => {
                if body.is_empty() {
                    TransferPacket::Response(CommandResponse::default())
                } else {
                    TransferPacket::Response(serde_json::from_slice(&body)?)
                }
            }
            PacketKind::Heartbeat => unreachable!("handled above"),
        };
        Ok(Some(packet))
    }

    // `read_exact` already loops until the buffer is full; mid-frame EOF is
    // mapped to the dedicated variant so callers can tell a truncated frame
    // from a clean close.
    async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ProtocolError::UnexpectedEof)
            }
            Err(e) => Err(ProtocolError::Io(e)),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// Writer half
// ---------------------------------------------------------------------------

/// Encodes frames onto an `AsyncWrite`, optionally under a byte budget.
pub struct FramedWriter<W> {
    inner: W,
    limiter: Option<RateLimiter>,
    max_body: usize,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        FramedWriter {
            inner,
            limiter: None,
            max_body: MAX_BODY_BYTES,
        }
    }

    /// A writer whose body bytes are paced at `bytes_per_sec`.
    pub fn with_rate_limit(inner: W, bytes_per_sec: u64) -> Self {
        FramedWriter {
            inner,
            limiter: Some(RateLimiter::new(bytes_per_sec)),
            max_body: MAX_BODY_BYTES,
        }
    }

    /// Encodes and writes one frame, flushing afterwards.
    ///
    /// `compress` applies to command/response bodies only; heartbeats have
    /// no body and never carry the compressed bit.
    pub async fn write_packet(
        &mut self,
        packet: &TransferPacket,
        compress: bool,
    ) -> Result<(), ProtocolError> {
        match packet {
            TransferPacket::Heartbeat => {
                let header = [PacketType::HEARTBEAT.byte()];
                if let Some(limiter) = &mut self.limiter {
                    limiter.acquire(header.len()).await;
                }
                self.inner.write_all(&header).await?;
                self.inner.flush().await?;
                Ok(())
            }
            TransferPacket::Command(cmd) => {
                let body = Bytes::from(serde_json::to_vec(cmd)?);
                self.write_frame(PacketType::JSON_COMMAND, body, compress)
                    .await
            }
            TransferPacket::Response(resp) => {
                let body = Bytes::from(serde_json::to_vec(resp)?);
                self.write_frame(PacketType::COMMAND_RESPONSE, body, compress)
                    .await
            }
        }
    }

    async fn write_frame(
        &mut self,
        packet_type: PacketType,
        mut body: Bytes,
        compress: bool,
    ) -> Result<(), ProtocolError> {
        let packet_type = if compress {
            body = gzip_compress(&body)?;
            packet_type.compressed()
        } else {
            packet_type
        };
        if body.len() > self.max_body {
            return Err(ProtocolError::FrameTooLarge {
                got: body.len(),
                limit: self.max_body,
            });
        }

        let mut header = BytesMut::with_capacity(HEADER_BYTES);
        header.put_u8(packet_type.byte());
        header.put_u32(body.len() as u32);
        let header = header.freeze();

        // The header is charged as one unit so it is never split across a
        // budget refill.
        if let Some(limiter) = &mut self.limiter {
            limiter.acquire(header.len()).await;
        }
        self.inner.write_all(&header).await?;

        if self.limiter.is_some() {
            while !body.is_empty() {
                let chunk = body.split_to(body.len().min(WRITE_CHUNK_BYTES));
                if let Some(limiter) = &mut self.limiter {
                    limiter.acquire(chunk.len()).await;
                }
                self.inner.write_all(&chunk).await?;
            }
        } else {
            self.inner.write_all(&body).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Token bucket over bytes with a one-second burst capacity.
///
/// Owned by a single writer task; acquisition larger than the remaining
/// budget sleeps until the deficit refills.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        RateLimiter {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    pub async fn acquire(&mut self, bytes: usize) {
        self.refill();
        let need = bytes as f64;
        if self.tokens >= need {
            self.tokens -= need;
            return;
        }
        let deficit = need - self.tokens;
        tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        self.refill();
        self.tokens = (self.tokens - need).max(0.0);
    }
}

// ---------------------------------------------------------------------------
// gzip helpers
// ---------------------------------------------------------------------------

fn gzip_compress(data: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(ProtocolError::Io)?;
    let compressed = encoder.finish().map_err(ProtocolError::Io)?;
    Ok(Bytes::from(compressed))
}

fn gzip_decompress(data: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(ProtocolError::Io)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandType;

    fn sample_packet() -> CommandPacket {
        CommandPacket {
            command_type: CommandType::TcpMapCreate,
            command_id: "cmd_1700000000000000000_connA".to_owned(),
            token: "req_17000000000000000001234".to_owned(),
            sender_id: "client-1".to_owned(),
            receiver_id: "server".to_owned(),
            command_body: r#"{"port":8080}"#.to_owned(),
        }
    }

    async fn encode(packet: &TransferPacket, compress: bool) -> Vec<u8> {
        let mut writer = FramedWriter::new(Vec::new());
        writer.write_packet(packet, compress).await.unwrap();
        writer.into_inner()
    }

    async fn decode(bytes: &[u8]) -> Option<TransferPacket> {
        let mut reader = FramedReader::new(bytes);
        reader.read_packet().await.unwrap()
    }

    #[tokio::test]
    async fn heartbeat_is_a_single_byte_and_round_trips() {
        let bytes = encode(&TransferPacket::Heartbeat, false).await;
        assert_eq!(bytes, vec![PacketType::HEARTBEAT.byte()]);

        let decoded = decode(&bytes).await.unwrap();
        assert_eq!(decoded, TransferPacket::Heartbeat);
    }

    #[tokio::test]
    async fn heartbeat_compress_flag_is_ignored_on_encode() {
        let bytes = encode(&TransferPacket::Heartbeat, true).await;
        assert_eq!(bytes, vec![PacketType::HEARTBEAT.byte()]);
    }

    #[tokio::test]
    async fn compressed_heartbeat_is_rejected_on_decode() {
        let bytes = vec![PacketType::HEARTBEAT.compressed().byte()];
        let mut reader = FramedReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::CompressedHeartbeat)
        ));
    }

    #[tokio::test]
    async fn command_round_trips_uncompressed() {
        let packet = TransferPacket::Command(sample_packet());
        let bytes = encode(&packet, false).await;

        // Header sanity: type byte, then big-endian length of the JSON body.
        assert_eq!(bytes[0], PacketType::JSON_COMMAND.byte());
        let len = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 5);

        assert_eq!(decode(&bytes).await.unwrap(), packet);
    }

    #[tokio::test]
    async fn command_round_trips_compressed() {
        let packet = TransferPacket::Command(sample_packet());
        let bytes = encode(&packet, true).await;
        assert!(PacketType::from_byte(bytes[0]).is_compressed());
        assert_eq!(decode(&bytes).await.unwrap(), packet);
    }

    #[tokio::test]
    async fn large_repetitive_body_survives_compression() {
        let mut packet = sample_packet();
        let entry = r#"{"host":"example.internal","port":443},"#;
        let mut body = String::from("[");
        while body.len() < 8 * 1024 {
            body.push_str(entry);
        }
        body.pop();
        body.push(']');
        packet.command_body = body;

        let original = TransferPacket::Command(packet);
        let bytes = encode(&original, true).await;
        // Repetitive JSON compresses well below the raw size.
        assert!(bytes.len() < 8 * 1024 / 2);
        assert_eq!(decode(&bytes).await.unwrap(), original);
    }

    #[tokio::test]
    async fn response_round_trips() {
        let mut resp = CommandResponse::ok(Some(r#"{"ok":true}"#.to_owned()));
        resp.request_id = "req_1".to_owned();
        resp.command_id = "cmd_1_connA".to_owned();
        resp.processing_time = 1_234_567;
        resp.handler_name = "tcp-map-create".to_owned();
        let packet = TransferPacket::Response(resp);

        let bytes = encode(&packet, false).await;
        assert_eq!(bytes[0], PacketType::COMMAND_RESPONSE.byte());
        assert_eq!(decode(&bytes).await.unwrap(), packet);
    }

    #[tokio::test]
    async fn zero_length_body_decodes_to_empty_packet() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(PacketType::JSON_COMMAND.byte());
        bytes.put_u32(0);

        let decoded = decode(&bytes).await.unwrap();
        match decoded {
            TransferPacket::Command(cmd) => {
                assert!(cmd.command_body.is_empty());
                assert_eq!(cmd.command_type, CommandType::Unknown);
            }
            other => panic!("expected empty command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn clean_close_between_frames_yields_none() {
        let empty: &[u8] = &[];
        let mut reader = FramedReader::new(empty);
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_after_type_byte_is_unexpected_eof() {
        let bytes = vec![PacketType::JSON_COMMAND.byte()];
        let mut reader = FramedReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let packet = TransferPacket::Command(sample_packet());
        let mut bytes = encode(&packet, false).await;
        bytes.truncate(bytes.len() - 3);

        let mut reader = FramedReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_body() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(PacketType::JSON_COMMAND.byte());
        bytes.put_u32(u32::MAX);

        let mut reader = FramedReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_json_body_is_a_packet_error() {
        let body = b"{not json";
        let mut bytes = BytesMut::new();
        bytes.put_u8(PacketType::JSON_COMMAND.byte());
        bytes.put_u32(body.len() as u32);
        bytes.put_slice(body);

        let mut reader = FramedReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::Json(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_writer_paces_body_bytes() {
        let start = Instant::now();
        let mut packet = sample_packet();
        packet.command_body = "x".repeat(4096);
        let frame = TransferPacket::Command(packet);

        let mut writer = FramedWriter::with_rate_limit(Vec::new(), 1024);
        writer.write_packet(&frame, false).await.unwrap();

        // ~4 KiB of body at 1 KiB/s with a 1 KiB initial burst: at least
        // three seconds of budget waits.
        assert!(start.elapsed() >= Duration::from_secs(3));

        let bytes = writer.into_inner();
        let decoded = FramedReader::new(bytes.as_slice())
            .read_packet()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
    }
}
