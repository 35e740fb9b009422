// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for QUIC stream framing.
//!
//! Each agent RPC uses one bidirectional QUIC stream carrying one request
//! frame and one response frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: protobuf payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size (4 MB). A list of a few thousand workers stays well
/// below this.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Length prefix plus message type.
pub const HEADER_SIZE: usize = 6;

/// Kind of frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Carries an `RpcRequest`.
    Request = 1,
    /// Carries an `RpcResponse`.
    Response = 2,
    /// Empty; the peer could not produce a response at all.
    Error = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("peer answered with an error frame")]
    ErrorFrame,

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("connection closed")]
    ConnectionClosed,
}

fn truncated(what: &str) -> FrameError {
    FrameError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, what.to_string()))
}

/// Payload length and type from a header, with the size limit applied.
fn parse_header(mut header: &[u8]) -> Result<(usize, MessageType), FrameError> {
    let length = header.get_u32() as usize;
    let message_type = MessageType::try_from(header.get_u16())?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }
    Ok((length, message_type))
}

/// One typed protobuf payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Request frame around `msg`.
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    /// Response frame around `msg`.
    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: payload.into(),
        })
    }

    /// Decode the payload.
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Header plus payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Parse one frame from the front of `bytes`.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(truncated("incomplete frame header"));
        }
        let (length, message_type) = parse_header(&bytes.split_to(HEADER_SIZE))?;
        if bytes.len() < length {
            return Err(truncated("incomplete frame payload"));
        }
        Ok(Self {
            message_type,
            payload: bytes.split_to(length),
        })
    }
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read one frame. EOF before a header is [`FrameError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
            _ => e.into(),
        });
    }
    let (length, message_type) = parse_header(&header)?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type,
        payload: payload.into(),
    })
}
