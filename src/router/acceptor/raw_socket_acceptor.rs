use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::debug;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpStream,
};

use crate::{
    core::types::HashSet,
    router::acceptor::acceptor::{
        Acceptance,
        Acceptor,
    },
    serializer::serializer::SerializerType,
    transport::raw_socket_transport::{
        HandshakeErrorCode,
        RawSocketCodec,
        RawSocketHandshake,
        RawSocketHandshakeError,
        RawSocketTransport,
    },
};

/// An [`Acceptor`] for raw-socket connections.
///
/// Performs the 4-byte handshake: validates the client's magic and reserved
/// bits, selects the serializer, and answers with this router's own maximum
/// message length. Unacceptable handshakes are answered with a single-byte
/// error code before the connection is dropped; no WAMP message is ever
/// involved.
pub struct RawSocketAcceptor {
    serializers: HashSet<SerializerType>,
    max_message_size: usize,
}

impl RawSocketAcceptor {
    pub fn new(serializers: HashSet<SerializerType>, max_message_size: usize) -> Self {
        Self {
            serializers,
            max_message_size,
        }
    }

    async fn refuse(mut stream: TcpStream, code: HandshakeErrorCode) -> Result<Acceptance> {
        debug!("Refusing raw socket handshake: {code:?}");
        stream.write_all(&code.response()).await.ok();
        stream.shutdown().await.ok();
        Err(Error::msg(format!("raw socket handshake refused: {code:?}")))
    }
}

#[async_trait]
impl Acceptor for RawSocketAcceptor {
    async fn accept(&self, mut stream: TcpStream) -> Result<Acceptance> {
        let mut buffer = [0u8; 4];
        stream.read_exact(&mut buffer).await?;

        let handshake = match RawSocketHandshake::decode(buffer) {
            Ok(handshake) => handshake,
            Err(RawSocketHandshakeError::ReservedBitsUsed) => {
                return Self::refuse(stream, HandshakeErrorCode::UseOfReservedBits).await;
            }
            // A handshake that does not even lead with the magic byte gets
            // no reply at all.
            Err(err) => return Err(err.into()),
        };

        let serializer = match SerializerType::from_raw_socket_id(handshake.serializer_id) {
            Some(serializer) if self.serializers.contains(&serializer) => serializer,
            _ => return Self::refuse(stream, HandshakeErrorCode::IllegalSerializer).await,
        };

        let receive_exponent = RawSocketHandshake::length_exponent_for(self.max_message_size);
        let response = RawSocketHandshake {
            length_exponent: receive_exponent,
            serializer_id: handshake.serializer_id,
        };
        stream.write_all(&response.encode()).await?;

        let codec = RawSocketCodec::new(
            response.max_message_size(),
            handshake.max_message_size(),
        );
        Ok(Acceptance {
            transport: Box::new(RawSocketTransport::new(stream, codec)),
            serializer,
        })
    }
}
