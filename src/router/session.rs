use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    info,
    warn,
};
use thiserror::Error;
use tokio::sync::{
    broadcast,
    mpsc::{
        self,
        error::TrySendError,
        UnboundedSender,
    },
    RwLock,
};

use crate::{
    auth::Identity,
    core::{
        close::CloseReason,
        error::{
            BasicError,
            InteractionError,
        },
        id::Id,
        roles::{
            peer_roles_from_details,
            router_roles_to_details,
            PeerRole,
        },
        types::{
            Dictionary,
            HashSet,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            ErrorMessage,
            HelloMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    router::{
        context::RouterContext,
        procedure::ProcedureManager,
        realm::RealmSession,
        topic::{
            PublishOptions,
            TopicManager,
        },
    },
};

/// Error for a message that could not be queued on a session's outbound
/// channel.
#[derive(Debug, Error)]
pub enum SessionWriteError {
    /// The outbound queue is at its high-water mark.
    #[error("session outbound queue is full")]
    Congested,
    /// The session is gone.
    #[error("session is closed")]
    Closed,
}

struct EstablishedSessionState {
    realm: Uri,
    roles: HashSet<PeerRole>,
    identity: Identity,
}

impl Debug for EstablishedSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[derive(Debug)]
        #[allow(unused)]
        struct DebugEstablishedSessionState<'a> {
            realm: &'a Uri,
        }

        DebugEstablishedSessionState { realm: &self.realm }.fmt(f)
    }
}

/// The session state machine.
///
/// `Closed` doubles as the initial (pre-HELLO) state and the terminal state:
/// in both, the only message the state machine accepts is a HELLO that opens
/// a (new) session.
#[derive(Debug, Default)]
enum SessionState {
    #[default]
    Closed,
    Established(EstablishedSessionState),
    Closing,
}

impl SessionState {
    fn is_same_state(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closed, Self::Closed) => true,
            (Self::Established(_), Self::Established(_)) => true,
            (Self::Closing, Self::Closing) => true,
            _ => false,
        }
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Closed, Self::Established(_)) => true,
            (Self::Established(_), Self::Closing) => true,
            (Self::Established(_), Self::Closed) => true,
            (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }
}

/// A handle to a session, for delivering messages routed from other
/// sessions.
///
/// The handle writes into the session's bounded outbound queue and never
/// blocks: once the queue hits its high-water mark, delivery fails with
/// [`SessionWriteError::Congested`] and the dispatcher decides what to drop
/// or synthesize.
pub struct SessionHandle {
    id: Id,
    message_tx: mpsc::Sender<Message>,
    closed_session_rx: broadcast::Receiver<()>,
}

impl SessionHandle {
    /// The session ID, as reported out to the peer.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Queues a message for delivery over the session.
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.message_tx
            .try_send(message)
            .map_err(|err| match err {
                TrySendError::Full(_) => Error::new(SessionWriteError::Congested),
                TrySendError::Closed(_) => Error::new(SessionWriteError::Closed),
            })
    }

    /// Asks the session to close with the given reason.
    pub fn close(&self, close_reason: CloseReason) -> Result<()> {
        self.send_message(goodbye_with_close_reason(close_reason))
    }

    /// The receiver channel that is populated when the session moves to the
    /// CLOSED state.
    pub fn closed_session_rx(&self) -> broadcast::Receiver<()> {
        self.closed_session_rx.resubscribe()
    }
}

/// The router end of a WAMP session.
///
/// Handles WAMP messages in a state machine and holds all session-scoped
/// state.
pub struct Session {
    id: Id,
    message_tx: mpsc::Sender<Message>,
    service_message_tx: UnboundedSender<Message>,
    state: RwLock<SessionState>,
    closed_session_tx: broadcast::Sender<()>,
}

impl Session {
    /// Creates a new session over a service.
    ///
    /// `message_tx` is the session's bounded outbound queue; the paired
    /// receiver is drained by the connection that owns the session.
    pub fn new(
        id: Id,
        message_tx: mpsc::Sender<Message>,
        service_message_tx: UnboundedSender<Message>,
    ) -> Self {
        let (closed_session_tx, _) = broadcast::channel(16);
        Self {
            id,
            message_tx,
            service_message_tx,
            state: RwLock::new(SessionState::default()),
            closed_session_tx,
        }
    }

    /// The session ID.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Checks if the session is closed.
    pub async fn closed(&self) -> bool {
        matches!(*self.state.read().await, SessionState::Closed)
    }

    /// Generates a handle to the session, which can be saved separately from
    /// the session's lifecycle.
    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            message_tx: self.message_tx.clone(),
            closed_session_rx: self.closed_session_tx.subscribe(),
        }
    }

    async fn get_from_established_session_state<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&EstablishedSessionState) -> T,
    {
        match &*self.state.read().await {
            SessionState::Established(state) => Ok(f(state)),
            _ => Err(Error::msg("session is not in the established state")),
        }
    }

    /// Sends a message directly to the session's own peer.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.transition_state_from_sending_message(&message).await?;
        self.service_message_tx
            .send(message)
            .map_err(Error::new)
    }

    async fn transition_state_from_sending_message(&self, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match *self.state.read().await {
                SessionState::Closing => SessionState::Closed,
                _ => SessionState::Closing,
            },
            _ => return Ok(()),
        };
        self.transition_state(next_state).await
    }

    /// Handles a message over the session state machine.
    ///
    /// An error return means the session must be torn down; the ABORT
    /// explaining why has already been sent.
    pub async fn handle_message(&self, context: &RouterContext, message: Message) -> Result<()> {
        debug!("Received message for session {}: {message:?}", self.id);
        if let Err(err) = self.handle_message_on_state_machine(context, message).await {
            self.send_message(abort_message_for_error(&err)).await?;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine(
        &self,
        context: &RouterContext,
        message: Message,
    ) -> Result<()> {
        // Read state separately from handling the message, so that we don't
        // lock the session state.
        let mut closing = false;
        let mut closed = false;
        match *self.state.read().await {
            SessionState::Closed => closed = true,
            SessionState::Closing => closing = true,
            _ => (),
        }

        if closed {
            self.handle_closed(context, message).await
        } else if closing {
            self.handle_closing(context, message).await
        } else {
            self.handle_established(context, message).await
        }
    }

    async fn handle_closed(&self, context: &RouterContext, message: Message) -> Result<()> {
        match message {
            Message::Hello(message) => self.handle_hello(context, &message).await,
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message before session establishment",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_hello(&self, context: &RouterContext, message: &HelloMessage) -> Result<()> {
        let roles = peer_roles_from_details(&message.details);
        if roles.is_empty() {
            return Err(InteractionError::ProtocolViolation(
                "peer announced no supported roles".to_owned(),
            )
            .into());
        }

        let mut realm_context = context.realm_context(&message.realm).await?;
        let identity = realm_context
            .realm()
            .authenticator
            .clone()
            .authenticate(message)
            .await?;

        realm_context.realm_mut().sessions.insert(
            self.id,
            RealmSession {
                session: self.session_handle(),
            },
        );
        info!(
            "Session {} joined realm {} as {} ({})",
            self.id,
            realm_context.realm().uri(),
            identity.id,
            identity.role
        );

        let mut details = Dictionary::default();
        details.insert(
            "agent".to_owned(),
            Value::String(context.router().config.agent.clone()),
        );
        details.insert(
            "roles".to_owned(),
            router_roles_to_details(context.router().config.roles.iter().cloned()),
        );
        details.insert("authid".to_owned(), Value::String(identity.id.clone()));
        details.insert("authrole".to_owned(), Value::String(identity.role.clone()));
        details.insert(
            "authmethod".to_owned(),
            Value::String(identity.method.clone()),
        );

        self.transition_state(SessionState::Established(EstablishedSessionState {
            realm: realm_context.realm().uri().clone(),
            roles,
            identity,
        }))
        .await?;

        self.send_message(Message::Welcome(WelcomeMessage {
            session: self.id,
            details,
        }))
        .await
    }

    async fn handle_established(&self, context: &RouterContext, message: Message) -> Result<()> {
        match message {
            Message::Abort(_) => {
                warn!("Router session {} aborted by peer: {message:?}", self.id);
                self.transition_state(SessionState::Closed).await
            }
            Message::Goodbye(_) => {
                self.transition_state(SessionState::Closing).await?;
                self.send_message(goodbye_and_out()).await
            }
            ref message @ Message::Subscribe(ref subscribe_message) => {
                if let Err(err) = self.handle_subscribe(context, subscribe_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Unsubscribe(ref unsubscribe_message) => {
                if let Err(err) = self.handle_unsubscribe(context, unsubscribe_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Publish(ref publish_message) => {
                if let Err(err) = self.handle_publish(context, publish_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Register(ref register_message) => {
                if let Err(err) = self.handle_register(context, register_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Unregister(ref unregister_message) => {
                if let Err(err) = self.handle_unregister(context, unregister_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            ref message @ Message::Call(ref call_message) => {
                if let Err(err) = self.handle_call(context, call_message).await {
                    return self.send_message(error_for_request(message, &err)).await;
                }
                Ok(())
            }
            Message::Yield(ref yield_message) => self.handle_yield(context, yield_message).await,
            Message::Error(ref error_message) => {
                self.handle_invocation_error(context, error_message).await
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn require_role(&self, role: PeerRole) -> Result<Uri> {
        let (realm, roles) = self
            .get_from_established_session_state(|state| (state.realm.clone(), state.roles.clone()))
            .await?;
        if !roles.contains(&role) {
            return Err(BasicError::NotAllowed(format!(
                "peer is not a {}",
                role.key_for_details()
            ))
            .into());
        }
        Ok(realm)
    }

    async fn handle_subscribe(
        &self,
        context: &RouterContext,
        message: &SubscribeMessage,
    ) -> Result<()> {
        let realm = self.require_role(PeerRole::Subscriber).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        let subscription =
            TopicManager::subscribe(&mut realm_context, self.id, message.topic.clone()).await?;
        self.send_message(Message::Subscribed(SubscribedMessage {
            subscribe_request: message.request,
            subscription,
        }))
        .await
    }

    async fn handle_unsubscribe(
        &self,
        context: &RouterContext,
        message: &UnsubscribeMessage,
    ) -> Result<()> {
        let realm = self.require_role(PeerRole::Subscriber).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        TopicManager::unsubscribe(&mut realm_context, self.id, message.subscribed_subscription)
            .await?;
        self.send_message(Message::Unsubscribed(UnsubscribedMessage {
            unsubscribe_request: message.request,
        }))
        .await
    }

    async fn handle_publish(
        &self,
        context: &RouterContext,
        message: &PublishMessage,
    ) -> Result<()> {
        let realm = self.require_role(PeerRole::Publisher).await?;
        let options = PublishOptions::from(&message.options);
        let mut realm_context = context.realm_context(&realm).await?;
        let publication =
            TopicManager::publish(&mut realm_context, self.id, message, &options).await?;
        if options.acknowledge {
            self.send_message(Message::Published(PublishedMessage {
                publish_request: message.request,
                publication,
            }))
            .await?;
        }
        Ok(())
    }

    async fn handle_register(
        &self,
        context: &RouterContext,
        message: &RegisterMessage,
    ) -> Result<()> {
        let realm = self.require_role(PeerRole::Callee).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        let registration =
            ProcedureManager::register(&mut realm_context, self.id, message.procedure.clone())
                .await?;
        self.send_message(Message::Registered(RegisteredMessage {
            register_request: message.request,
            registration,
        }))
        .await
    }

    async fn handle_unregister(
        &self,
        context: &RouterContext,
        message: &UnregisterMessage,
    ) -> Result<()> {
        let realm = self.require_role(PeerRole::Callee).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        ProcedureManager::unregister(
            &mut realm_context,
            self.id,
            message.registered_registration,
        )
        .await?;
        self.send_message(Message::Unregistered(UnregisteredMessage {
            unregister_request: message.request,
        }))
        .await
    }

    async fn handle_call(&self, context: &RouterContext, message: &CallMessage) -> Result<()> {
        let realm = self.require_role(PeerRole::Caller).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        ProcedureManager::call(&mut realm_context, self.id, message).await
    }

    async fn handle_yield(&self, context: &RouterContext, message: &YieldMessage) -> Result<()> {
        let realm = self.require_role(PeerRole::Callee).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        ProcedureManager::yield_result(&mut realm_context, self.id, message).await
    }

    async fn handle_invocation_error(
        &self,
        context: &RouterContext,
        message: &ErrorMessage,
    ) -> Result<()> {
        if message.request_type != Message::INVOCATION_TAG {
            return Err(InteractionError::ProtocolViolation(format!(
                "received ERROR message with unexpected request type {}",
                message.request_type
            ))
            .into());
        }
        let realm = self.require_role(PeerRole::Callee).await?;
        let mut realm_context = context.realm_context(&realm).await?;
        ProcedureManager::error_result(&mut realm_context, self.id, message).await
    }

    async fn handle_closing(&self, _: &RouterContext, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) => self.transition_state(SessionState::Closed).await,
            _ => Ok(()),
        }
    }

    async fn validate_state_transition(&self, state: &SessionState) -> Result<bool> {
        let current_state = self.state.read().await;
        if current_state.is_same_state(state) {
            return Ok(true);
        }

        if !current_state.allowed_state_transition(state) {
            return Err(BasicError::Internal(format!(
                "invalid state transition from {:?} to {state:?}",
                *current_state
            ))
            .into());
        }

        Ok(false)
    }

    async fn transition_state(&self, state: SessionState) -> Result<()> {
        if self.validate_state_transition(&state).await? {
            return Ok(());
        }

        debug!(
            "Router session {} transitioned from {:?} to {state:?}",
            self.id,
            self.state.read().await
        );
        *self.state.write().await = state;

        if let SessionState::Closed = &*self.state.read().await {
            self.closed_session_tx.send(()).ok();
        }

        Ok(())
    }

    /// Detaches the session from its realm, cascading cleanup through the
    /// broker and dealer.
    pub async fn clean_up(&self, context: &RouterContext) {
        let id = self.id;

        // We only need to clean up if we have resources in a realm.
        let (realm, identity) = match self
            .get_from_established_session_state(|state| {
                (state.realm.clone(), state.identity.clone())
            })
            .await
        {
            Ok(state) => state,
            Err(_) => {
                self.transition_state(SessionState::Closed).await.ok();
                return;
            }
        };

        match context.realm_context(&realm).await {
            Ok(mut realm_context) => {
                TopicManager::detach_session(&mut realm_context, id).await;
                ProcedureManager::detach_session(&mut realm_context, id).await;
                realm_context.realm_mut().sessions.remove(&id);
                info!("Session {id} ({}) left realm {realm}", identity.id);
            }
            Err(err) => {
                warn!("Failed to clean up session {id} in realm {realm}: {err:?}");
            }
        }

        self.transition_state(SessionState::Closed).await.ok();
    }
}
