use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    handshake::server::{
        Callback,
        ErrorResponse,
        Request,
        Response,
    },
    http::{
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue,
        StatusCode,
    },
    protocol::WebSocketConfig,
};

use crate::{
    core::types::HashSet,
    router::acceptor::acceptor::{
        Acceptance,
        Acceptor,
    },
    serializer::serializer::SerializerType,
    transport::web_socket_transport::WebSocketTransport,
};

struct WebSocketWampNegotiator {
    supported_protocols: HashSet<String>,
    selected_protocol: Option<String>,
}

impl WebSocketWampNegotiator {
    fn new(serializers: &HashSet<SerializerType>) -> Self {
        let supported_protocols = serializers
            .iter()
            .map(|serializer| serializer.uri().into())
            .collect();
        Self {
            supported_protocols,
            selected_protocol: None,
        }
    }

    fn reject_response<S>(message: S) -> ErrorResponse
    where
        S: Into<String>,
    {
        let mut response = ErrorResponse::new(Some(message.into()));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }

    fn callback(&mut self) -> impl Callback + use<'_> {
        |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let selected_protocol = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|protocols| match protocols.to_str() {
                    Ok(protocols) => protocols
                        .split(',')
                        .find(|protocol| self.supported_protocols.contains(protocol.trim())),
                    Err(_) => None,
                });
            let selected_protocol = match selected_protocol {
                Some(protocol) => protocol.trim(),
                None => return Err(Self::reject_response("no supported protocol")),
            };
            self.selected_protocol = Some(selected_protocol.to_owned());
            let header = match HeaderValue::from_str(selected_protocol) {
                Ok(header) => header,
                Err(_) => return Err(Self::reject_response("failed to create response header")),
            };
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, header);
            Ok(response)
        }
    }
}

/// An [`Acceptor`] for WebSocket connections.
///
/// The WAMP subprotocol announced during the WebSocket upgrade selects the
/// serializer; the upgrade is rejected when no announced subprotocol is
/// supported.
pub struct WebSocketAcceptor {
    serializers: HashSet<SerializerType>,
    max_message_size: usize,
}

impl WebSocketAcceptor {
    pub fn new(serializers: HashSet<SerializerType>, max_message_size: usize) -> Self {
        Self {
            serializers,
            max_message_size,
        }
    }
}

#[async_trait]
impl Acceptor for WebSocketAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<Acceptance> {
        let mut negotiator = WebSocketWampNegotiator::new(&self.serializers);
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        let stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            negotiator.callback(),
            Some(config),
        )
        .await?;
        let protocol = match negotiator.selected_protocol {
            Some(protocol) => protocol,
            None => return Err(Error::msg("expected protocol after negotiation")),
        };
        let serializer = SerializerType::try_from(protocol.as_str()).map_err(Error::msg)?;
        Ok(Acceptance {
            transport: Box::new(WebSocketTransport::new(stream, serializer)),
            serializer,
        })
    }
}
