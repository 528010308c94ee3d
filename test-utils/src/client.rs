//! Thin WAMP clients for exercising a router over real sockets.
//!
//! These clients speak the wire protocols directly, with no session state
//! machine of their own, so tests can drive (and misdrive) the router one
//! message at a time.

use std::net::SocketAddr;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpStream,
};
use tokio_tungstenite::{
    client_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue,
        },
        Message as WsMessage,
    },
    WebSocketStream,
};
use wamphub::{
    core::{
        id::Id,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        HelloMessage,
        Message,
    },
    serializer::serializer::{
        new_serializer,
        Serializer,
        SerializerType,
    },
};

fn hello_with_all_roles(realm: &str) -> Result<Message> {
    let roles = Dictionary::from_iter(
        ["caller", "callee", "publisher", "subscriber"]
            .into_iter()
            .map(|role| (role.to_owned(), Value::Dictionary(Dictionary::default()))),
    );
    Ok(Message::Hello(HelloMessage {
        realm: Uri::try_from(realm).map_err(Error::new)?,
        details: Dictionary::from_iter([("roles".to_owned(), Value::Dictionary(roles))]),
    }))
}

fn welcome_or_error(message: Message) -> Result<Id> {
    match message {
        Message::Welcome(message) => Ok(message.session),
        Message::Abort(message) => Err(Error::msg(format!(
            "aborted with reason {}",
            message.reason
        ))),
        message => Err(Error::msg(format!(
            "expected WELCOME, got {}",
            message.message_name()
        ))),
    }
}

/// A WAMP client over a WebSocket connection.
pub struct WebSocketClient {
    stream: WebSocketStream<TcpStream>,
    serializer: Box<dyn Serializer>,
    binary: bool,
}

impl WebSocketClient {
    /// Connects to the router, negotiating the subprotocol for the given
    /// serializer.
    pub async fn connect(addr: SocketAddr, serializer_type: SerializerType) -> Result<Self> {
        let mut request = format!("ws://{addr}").into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(serializer_type.uri().as_ref())?,
        );
        let stream = TcpStream::connect(addr).await?;
        let (stream, _) = client_async(request, stream).await?;
        Ok(Self {
            stream,
            serializer: new_serializer(serializer_type),
            binary: serializer_type == SerializerType::MessagePack,
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = self.serializer.serialize(message)?;
        let message = if self.binary {
            WsMessage::Binary(bytes.into())
        } else {
            WsMessage::Text(String::from_utf8(bytes)?.into())
        };
        self.stream.send(message).await.map_err(Error::new)
    }

    /// Sends a raw text frame, bypassing serialization.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.to_owned().into()))
            .await
            .map_err(Error::new)
    }

    /// Sends a raw binary frame, bypassing serialization.
    pub async fn send_binary(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .send(WsMessage::Binary(bytes.to_vec().into()))
            .await
            .map_err(Error::new)
    }

    /// Receives the next WAMP message, skipping transport-level frames.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Err(Error::msg("connection closed")),
            };
            if message.is_text() || message.is_binary() {
                return self.serializer.deserialize(&message.into_data());
            }
            if message.is_close() {
                return Err(Error::msg("connection closed"));
            }
        }
    }

    /// Sends HELLO with all four peer roles and waits for WELCOME.
    pub async fn join_realm(&mut self, realm: &str) -> Result<Id> {
        self.send(&hello_with_all_roles(realm)?).await?;
        welcome_or_error(self.recv().await?)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await.map_err(Error::new)
    }
}

const RAW_SOCKET_MAGIC: u8 = 0x7F;

const FRAME_KIND_MESSAGE: u8 = 0x00;
const FRAME_KIND_PING: u8 = 0x01;
const FRAME_KIND_PONG: u8 = 0x02;

/// A WAMP client over a raw-socket connection.
pub struct RawSocketClient {
    stream: TcpStream,
    serializer: Box<dyn Serializer>,
}

impl RawSocketClient {
    /// Connects to the router and performs the raw-socket handshake,
    /// requesting the 16 MiB maximum message length.
    pub async fn connect(addr: SocketAddr, serializer_type: SerializerType) -> Result<Self> {
        let serializer_id = serializer_type.raw_socket_id();
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(&[RAW_SOCKET_MAGIC, 0xF0 | serializer_id, 0, 0])
            .await?;

        let mut response = [0u8; 4];
        stream.read_exact(&mut response).await?;
        if response[0] != RAW_SOCKET_MAGIC {
            return Err(Error::msg("bad magic in handshake response"));
        }
        if response[1] & 0x0F == 0 {
            return Err(Error::msg(format!(
                "handshake refused with error code {}",
                response[1] >> 4
            )));
        }
        if response[1] & 0x0F != serializer_id {
            return Err(Error::msg("router selected an unexpected serializer"));
        }

        Ok(Self {
            stream,
            serializer: new_serializer(serializer_type),
        })
    }

    async fn send_frame(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        let length = (payload.len() as u32).to_be_bytes();
        self.stream.write_all(&[kind, length[1], length[2], length[3]]).await?;
        self.stream.write_all(payload).await?;
        Ok(())
    }

    /// Receives the next frame as a raw (kind, payload) pair.
    pub async fn recv_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        Ok((header[0], payload))
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = self.serializer.serialize(message)?;
        self.send_frame(FRAME_KIND_MESSAGE, &bytes).await
    }

    /// Sends a transport-level PING carrying the given payload.
    pub async fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(FRAME_KIND_PING, payload).await
    }

    /// Writes raw bytes to the stream, framing violations included.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.map_err(Error::new)
    }

    /// Receives the next WAMP message, answering pings and skipping pongs.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            let (kind, payload) = self.recv_frame().await?;
            match kind {
                FRAME_KIND_MESSAGE => return self.serializer.deserialize(&payload),
                FRAME_KIND_PING => self.send_frame(FRAME_KIND_PONG, &payload).await?,
                FRAME_KIND_PONG => continue,
                kind => return Err(Error::msg(format!("unknown frame kind {kind:#04x}"))),
            }
        }
    }

    /// Sends HELLO with all four peer roles and waits for WELCOME.
    pub async fn join_realm(&mut self, realm: &str) -> Result<Id> {
        self.send(&hello_with_all_roles(realm)?).await?;
        welcome_or_error(self.recv().await?)
    }
}
