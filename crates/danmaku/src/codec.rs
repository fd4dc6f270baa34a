//! Binary frame codec for the live message endpoint.
//!
//! Every frame starts with a 16 byte big-endian header:
//!
//! ```text
//! 0       4       6       8      12      16
//! +-------+-------+-------+-------+-------+--------------
//! | total |header |version|  op   |  seq  | body ...
//! +-------+-------+-------+-------+-------+--------------
//! ```
//!
//! Compressed frames (zlib or brotli) carry a body that is itself a
//! back-to-back run of frames. [`Frame::expand`] unpacks them; [`FrameCodec`]
//! does so automatically and keeps partial frames buffered across reads.

use std::collections::VecDeque;
use std::io::Read;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{DanmakuError, Result};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Upper bound on a single frame, before and after decompression. Anything
/// larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Operation codes understood by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Client keep-alive.
    Heartbeat,
    /// Server keep-alive reply, body is the room popularity as u32.
    HeartbeatReply,
    /// Server push with a JSON body.
    Notification,
    /// Client authentication handshake.
    Auth,
    /// Server handshake result, JSON body with a `code` field.
    AuthReply,
}

impl Operation {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            2 => Some(Self::Heartbeat),
            3 => Some(Self::HeartbeatReply),
            5 => Some(Self::Notification),
            7 => Some(Self::Auth),
            8 => Some(Self::AuthReply),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Heartbeat => 2,
            Self::HeartbeatReply => 3,
            Self::Notification => 5,
            Self::Auth => 7,
            Self::AuthReply => 8,
        }
    }
}

/// Protocol version field, which doubles as the body encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Uncompressed JSON.
    RawJson,
    /// Uncompressed, used by heartbeat/auth and their replies.
    Plain,
    /// zlib-compressed run of frames.
    Zlib,
    /// brotli-compressed run of frames.
    Brotli,
}

impl ProtocolVersion {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::RawJson),
            1 => Some(Self::Plain),
            2 => Some(Self::Zlib),
            3 => Some(Self::Brotli),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::RawJson => 0,
            Self::Plain => 1,
            Self::Zlib => 2,
            Self::Brotli => 3,
        }
    }
}

/// One decoded unit of the binary envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: ProtocolVersion,
    pub operation: Operation,
    pub sequence: u32,
    pub body: Bytes,
}

impl Frame {
    /// Create an uncompressed frame with sequence 1.
    pub fn new(operation: Operation, body: impl Into<Bytes>) -> Self {
        Self {
            version: ProtocolVersion::Plain,
            operation,
            sequence: 1,
            body: body.into(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Serialize header and body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        write_frame(self, &mut buf);
        buf.freeze()
    }

    /// Unpack a compressed frame into the frames it carries.
    ///
    /// Uncompressed frames are returned unchanged. Inside a batch, an inner
    /// frame that cannot be decoded is dropped on its own; decoding only
    /// stops early when an inner header leaves no boundary to resume from.
    pub fn expand(self) -> Result<Vec<Frame>> {
        let inner = match self.version {
            ProtocolVersion::Zlib => decompress_zlib(&self.body)?,
            ProtocolVersion::Brotli => decompress_brotli(&self.body)?,
            ProtocolVersion::RawJson | ProtocolVersion::Plain => return Ok(vec![self]),
        };

        let mut frames = Vec::new();
        let mut rest: &[u8] = &inner;
        while !rest.is_empty() {
            if rest.len() < HEADER_LEN {
                warn!(trailing = rest.len(), "Ignoring truncated tail of compressed batch");
                break;
            }
            let header = Header::parse(rest);
            if let Err(e) = header.check_lengths() {
                warn!(error = %e, "Abandoning rest of compressed batch");
                break;
            }
            if header.total_len > rest.len() {
                warn!(
                    declared = header.total_len,
                    available = rest.len(),
                    "Abandoning rest of compressed batch"
                );
                break;
            }

            let body = Bytes::copy_from_slice(&rest[header.header_len..header.total_len]);
            rest = &rest[header.total_len..];
            match header.into_frame(body).and_then(Frame::expand) {
                Ok(unpacked) => frames.extend(unpacked),
                Err(e) => warn!(error = %e, "Dropping malformed frame in compressed batch"),
            }
        }
        Ok(frames)
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    total_len: usize,
    header_len: usize,
    version: u16,
    operation: u32,
    sequence: u32,
}

impl Header {
    /// Caller guarantees `buf.len() >= HEADER_LEN`.
    fn parse(buf: &[u8]) -> Self {
        Self {
            total_len: BigEndian::read_u32(&buf[0..4]) as usize,
            header_len: BigEndian::read_u16(&buf[4..6]) as usize,
            version: BigEndian::read_u16(&buf[6..8]),
            operation: BigEndian::read_u32(&buf[8..12]),
            sequence: BigEndian::read_u32(&buf[12..16]),
        }
    }

    /// Length fields must be self-consistent before anything can be skipped.
    fn check_lengths(&self) -> Result<()> {
        if self.header_len < HEADER_LEN {
            return Err(DanmakuError::malformed(format!(
                "header length {} below minimum {}",
                self.header_len, HEADER_LEN
            )));
        }
        if self.total_len < self.header_len {
            return Err(DanmakuError::malformed(format!(
                "total length {} shorter than header length {}",
                self.total_len, self.header_len
            )));
        }
        if self.total_len > MAX_FRAME_LEN {
            return Err(DanmakuError::malformed(format!(
                "frame length {} exceeds limit",
                self.total_len
            )));
        }
        Ok(())
    }

    fn into_frame(self, body: Bytes) -> Result<Frame> {
        let operation = Operation::from_code(self.operation).ok_or_else(|| {
            DanmakuError::malformed(format!("unknown operation code {}", self.operation))
        })?;
        let version = ProtocolVersion::from_code(self.version).ok_or_else(|| {
            DanmakuError::malformed(format!("unknown protocol version {}", self.version))
        })?;
        Ok(Frame {
            version,
            operation,
            sequence: self.sequence,
            body,
        })
    }
}

/// Build a frame for `operation` around `body`.
pub fn encode(operation: Operation, body: &[u8]) -> Bytes {
    Frame::new(operation, Bytes::copy_from_slice(body)).to_bytes()
}

/// Decode exactly one frame from the front of `buf`.
///
/// Compressed bodies are returned as-is; use [`Frame::expand`] to unpack them.
/// Fails if the buffer holds less than the declared frame length.
pub fn decode(buf: &[u8]) -> Result<(Frame, &[u8])> {
    if buf.len() < HEADER_LEN {
        return Err(DanmakuError::malformed(format!(
            "need {} header bytes, have {}",
            HEADER_LEN,
            buf.len()
        )));
    }

    let header = Header::parse(buf);
    header.check_lengths()?;
    if header.total_len > buf.len() {
        return Err(DanmakuError::malformed(format!(
            "declared length {} exceeds available {} bytes",
            header.total_len,
            buf.len()
        )));
    }

    let body = Bytes::copy_from_slice(&buf[header.header_len..header.total_len]);
    let frame = header.into_frame(body)?;
    Ok((frame, &buf[header.total_len..]))
}

fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    let total_len = HEADER_LEN + frame.body.len();
    dst.reserve(total_len);
    dst.put_u32(total_len as u32);
    dst.put_u16(HEADER_LEN as u16);
    dst.put_u16(frame.version.code());
    dst.put_u32(frame.operation.code());
    dst.put_u32(frame.sequence);
    dst.put_slice(&frame.body);
}

/// Streaming codec that reassembles frames split across reads and unpacks
/// compressed batches.
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending: VecDeque<Frame>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DanmakuError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }

            let header = Header::parse(&src[..HEADER_LEN]);
            if let Err(e) = header.check_lengths() {
                // No trustworthy boundary to resync on.
                src.clear();
                return Err(e);
            }

            if src.len() < header.total_len {
                src.reserve(header.total_len - src.len());
                return Ok(None);
            }

            let raw = src.split_to(header.total_len).freeze();
            let frame = header.into_frame(raw.slice(header.header_len..))?;
            self.pending.extend(frame.expand()?);
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DanmakuError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        write_frame(&item, dst);
        Ok(())
    }
}

/// Decompress zlib data, refusing output beyond [`MAX_FRAME_LEN`].
fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    read_capped(ZlibDecoder::new(data), "zlib")
}

/// Decompress brotli data, refusing output beyond [`MAX_FRAME_LEN`].
fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    read_capped(brotli::Decompressor::new(data, 4096), "brotli")
}

fn read_capped(reader: impl Read, kind: &str) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    reader
        .take(MAX_FRAME_LEN as u64 + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| DanmakuError::malformed(format!("{} decompression failed: {}", kind, e)))?;
    if decompressed.len() > MAX_FRAME_LEN {
        return Err(DanmakuError::malformed(format!(
            "{} batch expands beyond {} bytes",
            kind, MAX_FRAME_LEN
        )));
    }
    Ok(decompressed)
}
