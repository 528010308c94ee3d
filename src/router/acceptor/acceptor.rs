use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::{
    serializer::serializer::SerializerType,
    transport::transport::Transport,
};

/// The result of an [`Acceptor`] successfully accepting a WAMP connection.
pub struct Acceptance {
    /// The established transport.
    pub transport: Box<dyn Transport>,

    /// The chosen serializer.
    pub serializer: SerializerType,
}

/// An acceptor, which accepts WAMP connections over a TCP stream.
///
/// Note that the acceptor only *accepts* connections. It does not establish
/// sessions. In other words, the acceptor is only responsible for
/// establishing that both the client and server can talk using WAMP, and
/// with which serializer.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Accepts the incoming TCP connection, erroring out if the transport
    /// handshake fails.
    async fn accept(&self, stream: TcpStream) -> Result<Acceptance>;
}
