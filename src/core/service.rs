use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
    error,
};
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            unbounded_channel,
            UnboundedReceiver,
            UnboundedSender,
        },
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::InteractionError,
        stream::{
            MessageStream,
            StreamMessage,
        },
    },
    message::{
        common::abort_message_for_error,
        message::Message,
    },
    serializer::serializer::Serializer,
    transport::transport::{
        MalformedMessage,
        Transport,
        TransportCloseReason,
    },
};

/// How long a connection may stay silent before the service gives up on it.
///
/// Transport pings count as traffic, so a peer only needs to ping to keep an
/// otherwise-idle connection alive.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A handle to an asynchronously-running [`Service`].
pub struct ServiceHandle {
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
    message_tx: UnboundedSender<Message>,
}

impl ServiceHandle {
    /// Joins the task running the service.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the service.
    ///
    /// Cancellation is the correct way to cleanly exit a service.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The message transmission channel.
    pub fn message_tx(&self) -> UnboundedSender<Message> {
        self.message_tx.clone()
    }
}

/// The core asynchronous service that sends and receives WAMP messages over
/// an underlying transport.
///
/// The goal of this module is to provide a common layer for WAMP messaging.
/// Received messages are passed to a channel for higher layers (a single
/// session on the router) to process.
///
/// This type assumes that errors are handled higher up in the stack: if a
/// session must be terminated, the session object sends ABORT before the
/// service is canceled. The one exception is a payload that fails to decode
/// to a message, which is answered with ABORT here since the session never
/// sees it. Transport framing errors close the connection with no WAMP
/// signaling at all.
pub struct Service {
    name: String,
    stream: MessageStream,
    message_tx: broadcast::Sender<Message>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
    cancel_tx: broadcast::Sender<()>,
    cancel_rx: broadcast::Receiver<()>,

    user_message_tx: UnboundedSender<Message>,
    user_message_rx: UnboundedReceiver<Message>,

    close_reason: TransportCloseReason,
}

impl Service {
    /// Creates a new service with the given transport and serialization.
    pub fn new(
        name: String,
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer>,
    ) -> Self {
        let stream = MessageStream::new(transport, serializer);
        let (message_tx, _) = broadcast::channel(16);
        let (end_tx, end_rx) = broadcast::channel(1);
        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let (user_message_tx, user_message_rx) = unbounded_channel();
        Self {
            name,
            stream,
            message_tx,
            end_tx,
            _end_rx: end_rx,
            cancel_tx,
            cancel_rx,
            user_message_tx,
            user_message_rx,
            close_reason: TransportCloseReason::Normal,
        }
    }

    /// The message receiver channel.
    pub fn message_rx(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    /// The end receiver channel.
    pub fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }

    /// Starts the service asynchronously.
    ///
    /// This method takes ownership of the service. All future interactions
    /// with the service should be made through the returned handle.
    pub fn start(self) -> ServiceHandle {
        let cancel_tx = self.cancel_tx.clone();
        let message_tx = self.user_message_tx.clone();
        let start_handle = tokio::spawn(self.run());
        ServiceHandle {
            start_handle,
            cancel_tx,
            message_tx,
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.service_loop().await {
            error!("Service {} failed: {err}", self.name);
        }
        if let Err(err) = self.end().await {
            error!("Failed to end service {}: {err}", self.name);
        }
    }

    async fn service_loop(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Ping(data))) => {
                            // Answered by writing straight to the transport,
                            // so the pong goes out ahead of anything still
                            // sitting in the outbound queue.
                            self.stream.send(StreamMessage::Ping(data)).await?;
                        },
                        Some(Ok(StreamMessage::Pong(data))) => {
                            debug!("Service {} received unsolicited pong ({} bytes)", self.name, data.len());
                        }
                        Some(Ok(StreamMessage::Message(message))) => {
                            // Send the message out for handling.
                            self.message_tx.send(message)?;
                        }
                        Some(Ok(StreamMessage::Close(_))) => {
                            return Ok(());
                        }
                        Some(Err(err)) => {
                            if err.downcast_ref::<MalformedMessage>().is_some() {
                                // The payload framed correctly but is not a
                                // WAMP message, so the peer gets an ABORT
                                // before the connection fails.
                                //
                                // Ignore send errors, since the stream may
                                // already be closed.
                                self.stream.send(StreamMessage::Message(abort_message_for_error(
                                    &InteractionError::ProtocolViolation(err.to_string()).into(),
                                ))).await.ok();
                                self.close_reason = TransportCloseReason::ProtocolError;
                            }
                            return Err(err);
                        }
                        None => {
                            return Ok(());
                        }
                    }
                }
                message = self.user_message_rx.recv() => {
                    match message {
                        Some(message) => {
                            if let Message::Abort(_) = message {
                                self.close_reason = TransportCloseReason::ProtocolError;
                            }
                            self.stream.send(StreamMessage::Message(message)).await?;
                        }
                        None => {
                            return Err(Error::msg("user message stream closed"));
                        }
                    }
                }
                // We expect that cancellation is the correct way to cleanly
                // exit the service.
                _ = self.cancel_rx.recv() => {
                    return Ok(());
                }
                // Timeout is implemented at this layer so that ping messages
                // are considered for keeping the connection alive.
                _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                    return Err(Error::msg("timed out"));
                }
            }
        }
    }

    async fn end(&mut self) -> Result<()> {
        // Signal close to the peer, then close the stream. Both are
        // best-effort, since the stream may already be gone.
        self.stream
            .send(StreamMessage::Close(self.close_reason))
            .await
            .ok();
        self.stream.close().await.ok();
        self.end_tx.send(())?;
        Ok(())
    }
}
