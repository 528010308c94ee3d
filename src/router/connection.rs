use anyhow::{
    Error,
    Result,
};
use log::{
    error,
    info,
};
use tokio::sync::{
    broadcast::{
        self,
        error::RecvError,
    },
    mpsc,
};
use uuid::Uuid;

use crate::{
    core::service::Service,
    message::message::Message,
    router::{
        context::RouterContext,
        session::Session,
    },
};

/// A connection from a router to a client.
///
/// On its own, a connection is not very meaningful. When started, it uses a
/// WAMP [`Service`] to send and receive messages on an underlying transport.
/// Messages are used to set up and manage a [`Session`], which handles all
/// interactions with the router.
///
/// A single connection can host multiple sessions back to back: after a
/// session ends with GOODBYE, the peer may open a new one with another HELLO
/// on the same transport.
#[derive(Debug)]
pub struct Connection {
    uuid: Uuid,
}

impl Connection {
    /// Creates a new connection.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    /// The unique identifier of the connection.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Starts the connection on the runtime.
    pub fn start(self, context: RouterContext, service: Service) {
        tokio::spawn(self.run(context, service));
    }

    async fn run(self, context: RouterContext, service: Service) {
        let mut service_message_rx = service.message_rx();
        let end_rx = service.end_rx();
        let service_handle = service.start();

        loop {
            if self
                .run_session(
                    &context,
                    service_handle.message_tx(),
                    &mut service_message_rx,
                    end_rx.resubscribe(),
                )
                .await
            {
                break;
            }
        }
        info!("Connection {} will have no more sessions", self.uuid);

        if let Err(err) = service_handle.cancel() {
            error!(
                "Failed to cancel service for connection {}: {err}",
                self.uuid
            );
        }
        if let Err(err) = service_handle.join().await {
            error!("Failed to join service for connection {}: {err}", self.uuid);
        }
    }

    /// Runs a single session over the connection.
    ///
    /// Returns whether the connection is done hosting sessions.
    async fn run_session(
        &self,
        context: &RouterContext,
        service_message_tx: mpsc::UnboundedSender<Message>,
        service_message_rx: &mut broadcast::Receiver<Message>,
        end_rx: broadcast::Receiver<()>,
    ) -> bool {
        let session_id = match context.router().id_allocator.generate_id().await {
            Ok(session_id) => session_id,
            Err(err) => {
                error!(
                    "Failed to allocate a session ID for connection {}: {err}",
                    self.uuid
                );
                return true;
            }
        };
        let (message_tx, message_rx) = mpsc::channel(
            context
                .router()
                .config
                .outbound_high_water_mark
                .max(1),
        );
        let session = Session::new(session_id, message_tx, service_message_tx);

        info!(
            "Proactively starting router session {session_id} for connection {}",
            self.uuid
        );

        let done = match self
            .session_loop(context, &session, message_rx, service_message_rx, end_rx)
            .await
        {
            Ok(done) => {
                info!(
                    "Router session {} for connection {} finished",
                    session.id(),
                    self.uuid
                );
                done
            }
            Err(err) => {
                error!(
                    "Router session {} for connection {} failed: {err:#}",
                    session.id(),
                    self.uuid
                );
                true
            }
        };

        session.clean_up(context).await;
        done
    }

    async fn session_loop(
        &self,
        context: &RouterContext,
        session: &Session,
        mut message_rx: mpsc::Receiver<Message>,
        service_message_rx: &mut broadcast::Receiver<Message>,
        mut end_rx: broadcast::Receiver<()>,
    ) -> Result<bool> {
        let mut router_end_rx = context.router().end_rx();

        loop {
            tokio::select! {
                // Draining the outbound queue comes first: while this
                // session's queue sits at its high-water mark, inbound
                // messages from the peer wait.
                biased;
                // A message routed from some other part of the router
                // (an EVENT, INVOCATION, RESULT, or synthesized ERROR).
                message = message_rx.recv() => {
                    let message = match message {
                        Some(message) => message,
                        None => return Err(Error::msg("failed to receive message from connection channel")),
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.send_message(message).await {
                        return Err(err.context(format!("failed to send {message_name} message")));
                    }
                }
                // A message from the peer, already decoded by the service.
                message = service_message_rx.recv() => {
                    let message = match message {
                        Ok(message) => message,
                        // Transport closed.
                        Err(RecvError::Closed) => return Ok(true),
                        Err(err) => return Err(Error::new(err).context("failed to receive message")),
                    };
                    session.handle_message(context, message).await?;
                }
                // Service ended: the transport is gone.
                _ = end_rx.recv() => return Ok(true),
                // Router ended. The router shuts down realms first, which
                // closes sessions cleanly; ending up here means the session
                // was not attached to any realm, and terminating the
                // connection abruptly is OK.
                _ = router_end_rx.recv() => return Ok(true),
            }

            if session.closed().await {
                // The session is over, but the transport may host another.
                return Ok(false);
            }
        }
    }
}
