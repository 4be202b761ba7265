//! Length-prefixed framing for push connections.
//!
//! Every frame on the wire is laid out as:
//!
//! ```text
//! +------------+---------+------+-------+-----------------+-----------+
//! | length u32 | version | kind | flags | message id u64  |  payload  |
//! +------------+---------+------+-------+-----------------+-----------+
//! ```
//!
//! All integers are little-endian. `length` counts every byte after the
//! 4-byte prefix (header plus payload). Bit 0 of `flags` marks an
//! LZ4-compressed payload.
//!
//! Decoding is resumable: [`FrameDecoder`] buffers whatever the socket hands
//! it and yields one [`Frame`] per complete frame, in arrival order.

use std::fmt;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};

/// Current wire-protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the header that follows the length prefix (version, kind, flags, id).
pub const HEADER_LEN: usize = 11;

/// Header flag: payload is LZ4-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Caller-assigned identifier of a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Frame type tag carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Push content travelling to the client.
    Data = 1,
    /// Client acknowledgment of a data frame with the same message id.
    Ack = 2,
    /// Keepalive, echoed by the server.
    Heartbeat = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Heartbeat),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub kind: FrameKind,
    /// Message the frame refers to (0 for heartbeats).
    pub message_id: MessageId,
    /// Opaque payload, always uncompressed in memory.
    pub payload: Vec<u8>,
}

impl Frame {
    /// A data frame carrying `payload` for `message_id`.
    pub fn data(message_id: MessageId, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Data,
            message_id,
            payload,
        }
    }

    /// An acknowledgment for `message_id`.
    pub fn ack(message_id: MessageId) -> Self {
        Self {
            kind: FrameKind::Ack,
            message_id,
            payload: Vec::new(),
        }
    }

    /// A heartbeat frame.
    pub fn heartbeat() -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            message_id: MessageId(0),
            payload: Vec::new(),
        }
    }
}

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size (header + payload, excluding the length prefix).
    /// Default: 64 KiB.
    pub max_frame_size: u32,
    /// Payload compression policy for data frames.
    pub compression: CompressionConfig,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            compression: CompressionConfig::default(),
        }
    }
}

impl FrameConfig {
    /// Largest payload a frame can carry under this config.
    pub fn max_payload_size(&self) -> usize {
        (self.max_frame_size as usize).saturating_sub(HEADER_LEN)
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The actual frame size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The length prefix is smaller than the fixed header.
    #[error("frame length {0} is shorter than the header")]
    FrameTooShort(u32),

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The kind byte is not a known [`FrameKind`].
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    /// A compressed payload could not be restored.
    #[error("payload decompression failed: {0}")]
    Compression(#[from] CompressionError),

    /// An I/O error occurred while writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a frame into its wire representation.
///
/// Data payloads are compressed when the config calls for it. Frames larger
/// than [`FrameConfig::max_frame_size`] are rejected.
pub fn encode_frame(frame: &Frame, config: &FrameConfig) -> Result<Vec<u8>, FrameError> {
    let max = config.max_frame_size;
    let raw_size = HEADER_LEN + frame.payload.len();
    if raw_size > max as usize {
        return Err(FrameError::FrameTooLarge {
            size: raw_size,
            max,
        });
    }

    let compressed = match frame.kind {
        FrameKind::Data => compress_payload(&frame.payload, &config.compression),
        FrameKind::Ack | FrameKind::Heartbeat => None,
    };
    let (flags, payload) = match compressed.as_deref() {
        Some(bytes) => (FLAG_COMPRESSED, bytes),
        None => (0, frame.payload.as_slice()),
    };

    let body_len = HEADER_LEN + payload.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.push(PROTOCOL_VERSION);
    out.push(frame.kind as u8);
    out.push(flags);
    out.extend_from_slice(&frame.message_id.0.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, or the
/// frame together with the number of bytes it occupied.
pub fn decode_frame(buf: &[u8], config: &FrameConfig) -> Result<Option<(Frame, usize)>, FrameError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_LEN) else {
        return Ok(None);
    };
    let body_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

    if body_len > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: body_len as usize,
            max: config.max_frame_size,
        });
    }
    if (body_len as usize) < HEADER_LEN {
        return Err(FrameError::FrameTooShort(body_len));
    }

    let total = LENGTH_PREFIX_LEN + body_len as usize;
    let Some(body) = buf.get(LENGTH_PREFIX_LEN..total) else {
        return Ok(None);
    };

    let version = body[0];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let kind = FrameKind::try_from(body[1])?;
    let flags = body[2];
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&body[3..HEADER_LEN]);
    let message_id = MessageId(u64::from_le_bytes(id_bytes));

    let raw = &body[HEADER_LEN..];
    let payload = if flags & FLAG_COMPRESSED != 0 {
        decompress_payload(raw, config.max_payload_size())?
    } else {
        raw.to_vec()
    };

    Ok(Some((
        Frame {
            kind,
            message_id,
            payload,
        },
        total,
    )))
}

/// Resumable decoder that accumulates partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Start of the undecoded bytes in `buf`.
    pos: usize,
    config: FrameConfig,
}

impl FrameDecoder {
    /// Create a decoder with the given config.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            config,
        }
    }

    /// Append freshly read bytes, first discarding what was already decoded.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `Ok(None)` if more data is needed.
    ///
    /// After an error the buffered stream is unusable; the connection should
    /// be closed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_frame(&self.buf[self.pos..], &self.config)? {
            Some((frame, consumed)) => {
                self.pos += consumed;
                if self.pos == self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Encode and write a single frame, flushing the writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let bytes = encode_frame(frame, config)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
