use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};
use thiserror::Error;

/// Error for traffic that framed correctly at the transport layer but
/// violates the WAMP binding on top of it: a payload that does not decode to
/// a WAMP message, or a WebSocket frame type that contradicts the negotiated
/// subprotocol.
///
/// Plain framing errors close the connection silently; this error is the
/// marker that lets higher layers answer with a WAMP-level ABORT first and
/// signal a protocol-violation close.
#[derive(Debug, Error)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(pub String);

/// The way a transport should close, reflected in transport-level close
/// signaling (e.g., the WebSocket close code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCloseReason {
    /// Orderly close after the session ended normally.
    Normal,
    /// Close provoked by a protocol violation.
    ProtocolError,
}

/// Data received from or sent over a [`Transport`].
pub enum TransportData {
    /// A health check that should be answered with [`TransportData::Ping`]
    /// carrying the same payload; the transport writes it back as its
    /// pong-equivalent.
    Ping(Vec<u8>),
    /// An answer to a previously-sent health check.
    Pong(Vec<u8>),
    /// Data representing a meaningful WAMP message.
    Message(Vec<u8>),
    /// A request to signal close to the peer.
    Close(TransportCloseReason),
}

/// A transport, over which WAMP messages can be sent and received.
///
/// Implemented as a [`Stream`] and [`Sink`] that extracts out meaningful data
/// and reports framing violations to be handled at higher layers.
pub trait Transport:
    Send + Stream<Item = Result<TransportData>> + Sink<TransportData, Error = Error> + Unpin + Debug
{
}
