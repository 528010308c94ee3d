use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use bytes::{
    Buf,
    BufMut,
    BytesMut,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{
    Decoder,
    Encoder,
    Framed,
};

use crate::transport::transport::{
    Transport,
    TransportData,
};

/// The magic byte opening the raw-socket handshake.
pub const RAW_SOCKET_MAGIC: u8 = 0x7F;

/// Length of the per-message frame header: one kind byte followed by a 24-bit
/// big-endian payload length.
const FRAME_HEADER_LEN: usize = 4;

const FRAME_KIND_MESSAGE: u8 = 0x00;
const FRAME_KIND_PING: u8 = 0x01;
const FRAME_KIND_PONG: u8 = 0x02;

/// Error code the router answers a failed raw-socket handshake with, carried
/// in the high nibble of the second response byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeErrorCode {
    IllegalSerializer = 0,
    MaxLengthUnacceptable = 1,
    UseOfReservedBits = 2,
    MaxConnectionsReached = 3,
}

impl HandshakeErrorCode {
    /// The 4-byte error response sent before closing the connection.
    pub fn response(&self) -> [u8; 4] {
        [RAW_SOCKET_MAGIC, (*self as u8) << 4, 0, 0]
    }
}

/// Error for a raw-socket handshake that cannot be interpreted at all.
///
/// Distinct from [`HandshakeErrorCode`]: these failures get no error
/// response, the connection is simply closed.
#[derive(Debug, Error)]
pub enum RawSocketHandshakeError {
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("use of reserved bits")]
    ReservedBitsUsed,
}

/// The 4-byte handshake exchanged in each direction before any message.
///
/// The second byte carries the maximum message length exponent in its high
/// nibble (the sender accepts messages up to `2^(9 + exponent)` bytes) and
/// the serializer identifier in its low nibble. The last two bytes are
/// reserved and must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSocketHandshake {
    pub length_exponent: u8,
    pub serializer_id: u8,
}

impl RawSocketHandshake {
    pub fn decode(bytes: [u8; 4]) -> Result<Self, RawSocketHandshakeError> {
        if bytes[0] != RAW_SOCKET_MAGIC {
            return Err(RawSocketHandshakeError::BadMagic(bytes[0]));
        }
        if bytes[2] != 0 || bytes[3] != 0 {
            return Err(RawSocketHandshakeError::ReservedBitsUsed);
        }
        Ok(Self {
            length_exponent: bytes[1] >> 4,
            serializer_id: bytes[1] & 0x0F,
        })
    }

    pub fn encode(&self) -> [u8; 4] {
        [
            RAW_SOCKET_MAGIC,
            (self.length_exponent << 4) | (self.serializer_id & 0x0F),
            0,
            0,
        ]
    }

    /// The maximum message size the sender of this handshake accepts.
    pub fn max_message_size(&self) -> usize {
        1 << (9 + self.length_exponent)
    }

    /// The largest length exponent whose message size fits within
    /// `max_message_size`.
    ///
    /// Exponents run from 0 (512 B) to 15 (16 MiB).
    pub fn length_exponent_for(max_message_size: usize) -> u8 {
        let mut exponent = 0u8;
        while exponent < 15 && (1usize << (10 + u32::from(exponent))) <= max_message_size {
            exponent += 1;
        }
        exponent
    }
}

/// A single frame on a raw-socket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSocketFrame {
    Message(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Error produced by the raw-socket frame codec.
///
/// All of these are framing violations (or I/O failures): the connection
/// fails without any WAMP-level signaling.
#[derive(Debug, Error)]
pub enum RawSocketError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zero-length message payload")]
    ZeroLengthPayload,
    #[error("message of {size} bytes exceeds the negotiated limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown frame kind {0:#04x}")]
    UnknownFrameKind(u8),
}

/// Frame codec for established raw-socket connections.
///
/// Each frame is a 4-byte header (kind byte, then a 24-bit big-endian payload
/// length) followed by the payload. Inbound payloads are bounded by the limit
/// this router announced in its handshake; outbound payloads by the limit the
/// peer announced. Lengths are validated before any payload is buffered.
#[derive(Debug, Clone)]
pub struct RawSocketCodec {
    receive_limit: usize,
    send_limit: usize,
}

impl RawSocketCodec {
    pub fn new(receive_limit: usize, send_limit: usize) -> Self {
        Self {
            receive_limit,
            send_limit,
        }
    }
}

impl Decoder for RawSocketCodec {
    type Item = RawSocketFrame;
    type Error = RawSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let length = u32::from_be_bytes([0, src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(RawSocketError::ZeroLengthPayload);
        }
        if length > self.receive_limit {
            return Err(RawSocketError::FrameTooLarge {
                size: length,
                max: self.receive_limit,
            });
        }

        let total_len = FRAME_HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length).to_vec();

        match kind {
            FRAME_KIND_MESSAGE => Ok(Some(RawSocketFrame::Message(payload))),
            FRAME_KIND_PING => Ok(Some(RawSocketFrame::Ping(payload))),
            FRAME_KIND_PONG => Ok(Some(RawSocketFrame::Pong(payload))),
            kind => Err(RawSocketError::UnknownFrameKind(kind)),
        }
    }
}

impl Encoder<RawSocketFrame> for RawSocketCodec {
    type Error = RawSocketError;

    fn encode(&mut self, item: RawSocketFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, payload) = match &item {
            RawSocketFrame::Message(payload) => (FRAME_KIND_MESSAGE, payload),
            RawSocketFrame::Ping(payload) => (FRAME_KIND_PING, payload),
            RawSocketFrame::Pong(payload) => (FRAME_KIND_PONG, payload),
        };

        if payload.len() > self.send_limit || payload.len() > 0x00FF_FFFF {
            return Err(RawSocketError::FrameTooLarge {
                size: payload.len(),
                max: self.send_limit,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u8(kind);
        let length = (payload.len() as u32).to_be_bytes();
        dst.extend_from_slice(&length[1..]);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

/// A transport implemented for a TCP stream using the WAMP raw-socket
/// framing.
#[derive(Debug)]
pub struct RawSocketTransport {
    framed: Framed<TcpStream, RawSocketCodec>,
}

impl RawSocketTransport {
    /// Wraps an already-handshaken TCP stream.
    pub fn new(stream: TcpStream, codec: RawSocketCodec) -> Self {
        Self {
            framed: Framed::new(stream, codec),
        }
    }
}

impl Transport for RawSocketTransport {}

impl Stream for RawSocketTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.framed.poll_next_unpin(cx)) {
            Some(Ok(RawSocketFrame::Message(data))) => {
                task::Poll::Ready(Some(Ok(TransportData::Message(data))))
            }
            Some(Ok(RawSocketFrame::Ping(data))) => {
                task::Poll::Ready(Some(Ok(TransportData::Ping(data))))
            }
            Some(Ok(RawSocketFrame::Pong(data))) => {
                task::Poll::Ready(Some(Ok(TransportData::Pong(data))))
            }
            Some(Err(err)) => task::Poll::Ready(Some(Err(err.into()))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<TransportData> for RawSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.framed.poll_ready_unpin(cx).map_err(Error::new)
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        item: TransportData,
    ) -> std::result::Result<(), Self::Error> {
        let frame = match item {
            // Pings are answered in place, so sending one means ponging the
            // peer back.
            TransportData::Ping(data) => RawSocketFrame::Pong(data),
            TransportData::Pong(data) => RawSocketFrame::Pong(data),
            TransportData::Message(data) => RawSocketFrame::Message(data),
            // Raw sockets have no close signaling; the TCP close that
            // follows is the whole story.
            TransportData::Close(_) => return Ok(()),
        };
        self.framed.start_send_unpin(frame).map_err(Error::new)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.framed.poll_flush_unpin(cx).map_err(Error::new)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<std::result::Result<(), Self::Error>> {
        self.framed.poll_close_unpin(cx).map_err(Error::new)
    }
}
