use std::{
    net::{
        IpAddr,
        Ipv4Addr,
        SocketAddr,
    },
    sync::Arc,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::future::join_all;
use log::{
    debug,
    error,
    info,
};
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
};

use crate::{
    core::{
        close::CloseReason,
        id::{
            IdAllocator,
            RandomIdAllocator,
            SequentialIdAllocator,
        },
        roles::RouterRole,
        service::Service,
        types::HashSet,
        uri::Uri,
    },
    router::{
        acceptor::{
            acceptor::Acceptor,
            raw_socket_acceptor::RawSocketAcceptor,
            web_socket_acceptor::WebSocketAcceptor,
        },
        connection::Connection,
        context::RouterContext,
        realm::{
            Realm,
            RealmConfig,
            RealmManager,
        },
    },
    serializer::serializer::{
        new_serializer,
        SerializerType,
    },
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// The default cap on a single WAMP message, for both transport families.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The default per-session outbound queue high-water mark, in messages.
pub const DEFAULT_OUTBOUND_HIGH_WATER_MARK: usize = 64;

/// The transport family a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Length-prefixed binary framing directly over TCP.
    RawSocket,
    /// WebSocket with the `wamp.2.*` subprotocols.
    WebSocket,
}

/// Configuration for a single listening socket.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub kind: TransportKind,
    /// IP address the listener binds on.
    pub address: IpAddr,
    /// Network port the listener binds on. Use 0 to bind an ephemeral port.
    pub port: u16,
    /// Largest WAMP message accepted over this listener.
    pub max_message_size: usize,
}

impl ListenerConfig {
    pub fn raw_socket(address: IpAddr, port: u16) -> Self {
        Self {
            kind: TransportKind::RawSocket,
            address,
            port,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn web_socket(address: IpAddr, port: u16) -> Self {
        Self {
            kind: TransportKind::WebSocket,
            address,
            port,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// A listener on the loopback interface with an ephemeral port, as used
    /// in tests.
    pub fn local(kind: TransportKind) -> Self {
        Self {
            kind,
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Configuration for a [`Router`].
#[derive(Debug)]
pub struct RouterConfig {
    /// Agent name, communicated to peers.
    pub agent: String,
    /// Roles implemented by the router.
    pub roles: HashSet<RouterRole>,
    /// Allowed serializers.
    ///
    /// The actual serializer is selected per connection, during the
    /// transport handshake.
    pub serializers: HashSet<SerializerType>,
    /// Realms available on the router.
    pub realms: Vec<RealmConfig>,
    /// Listening sockets the router serves.
    pub listeners: Vec<ListenerConfig>,
    /// Per-session outbound queue high-water mark, in messages.
    ///
    /// Once a session's queue is this deep, events to it are dropped and
    /// invocations and results are answered with an error, until the queue
    /// drains.
    pub outbound_high_water_mark: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([RouterRole::Broker, RouterRole::Dealer]),
            serializers: HashSet::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            realms: Vec::default(),
            listeners: Vec::default(),
            outbound_high_water_mark: DEFAULT_OUTBOUND_HIGH_WATER_MARK,
        }
    }
}

/// A handle to an asynchronously-running [`Router`].
///
/// The router's ownership is transferred away when it starts. This handle
/// allows interaction with the router as it is running asynchronously.
pub struct RouterHandle {
    local_addrs: Vec<(TransportKind, SocketAddr)>,
    start_handle: JoinHandle<()>,
    cancel_tx: broadcast::Sender<()>,
}

impl RouterHandle {
    /// Joins the router task, effectively waiting for the router to stop
    /// altogether.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the router.
    ///
    /// Cancellation is asynchronous. Use [`Self::join`] to wait for the
    /// router to stop.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The local addresses of all listeners, in configuration order.
    pub fn local_addrs(&self) -> &[(TransportKind, SocketAddr)] {
        &self.local_addrs
    }

    /// The local address of the first listener of the given kind.
    pub fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.local_addrs
            .iter()
            .find(|(listener_kind, _)| *listener_kind == kind)
            .map(|(_, addr)| *addr)
    }
}

/// A WAMP router that accepts incoming connections over raw-socket and
/// WebSocket listeners and routes messages between the sessions attached to
/// its realms.
pub struct Router {
    /// The router configuration when created.
    pub(crate) config: RouterConfig,

    /// Realm registry, fixed at startup.
    pub(crate) realm_manager: RealmManager,

    /// Allocator for global-scope IDs (sessions, publications).
    pub(crate) id_allocator: Box<dyn IdAllocator>,

    /// Allocator for router-scope IDs (subscriptions, registrations,
    /// invocation requests).
    pub(crate) router_id_allocator: Box<dyn IdAllocator>,

    cancel_tx: broadcast::Sender<()>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
}

impl Router {
    /// Creates a new [`Router`], with one realm per configured realm.
    pub fn new(config: RouterConfig) -> Result<Self> {
        let mut realm_manager = RealmManager::default();
        for realm_config in &config.realms {
            realm_manager.insert(Realm::new(realm_config.clone()));
        }
        let (cancel_tx, _) = broadcast::channel(1);
        let (end_tx, end_rx) = broadcast::channel(1);
        Ok(Self {
            config,
            realm_manager,
            id_allocator: Box::new(RandomIdAllocator::default()),
            router_id_allocator: Box::new(SequentialIdAllocator::default()),
            cancel_tx,
            end_tx,
            _end_rx: end_rx,
        })
    }

    /// Adds a realm before the router starts.
    pub fn add_realm(&mut self, config: RealmConfig) {
        self.realm_manager.insert(Realm::new(config));
    }

    /// Adds a listening socket before the router starts.
    pub fn add_listener(&mut self, config: ListenerConfig) {
        self.config.listeners.push(config);
    }

    /// Receiver channel for determining when the router ends.
    pub(crate) fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }

    /// Starts the router asynchronously.
    ///
    /// Binds every configured listener; the returned handle can be used to
    /// interact with the router since its ownership is transferred away.
    pub async fn start(self) -> Result<RouterHandle> {
        info!("Starting router {}: {:?}", self.config.agent, self.config);

        let mut listeners = Vec::default();
        let mut local_addrs = Vec::default();
        for listener_config in &self.config.listeners {
            let addr = format!("{}:{}", listener_config.address, listener_config.port);
            let listener = TcpListener::bind(&addr).await?;
            let local_addr = listener.local_addr()?;
            info!(
                "Router {} listening for {:?} connections at {local_addr}",
                self.config.agent, listener_config.kind
            );
            local_addrs.push((listener_config.kind, local_addr));
            listeners.push((listener_config.clone(), listener));
        }

        let cancel_tx = self.cancel_tx.clone();
        let context = RouterContext::new(self);
        let start_handle = tokio::spawn(Self::handle_listeners(context, listeners));

        Ok(RouterHandle {
            local_addrs,
            start_handle,
            cancel_tx,
        })
    }

    fn acceptor_for(&self, config: &ListenerConfig) -> Arc<dyn Acceptor> {
        match config.kind {
            TransportKind::RawSocket => Arc::new(RawSocketAcceptor::new(
                self.config.serializers.clone(),
                config.max_message_size,
            )),
            TransportKind::WebSocket => Arc::new(WebSocketAcceptor::new(
                self.config.serializers.clone(),
                config.max_message_size,
            )),
        }
    }

    async fn handle_listeners(
        context: RouterContext,
        listeners: Vec<(ListenerConfig, TcpListener)>,
    ) {
        let mut connection_loops = Vec::default();
        for (listener_config, listener) in listeners {
            connection_loops.push(tokio::spawn(Self::connection_loop(
                context.clone(),
                listener_config,
                listener,
            )));
        }
        join_all(connection_loops).await;

        Self::shut_down(&context).await;
        if let Err(err) = context.router().end_tx.send(()) {
            error!("Failed to write to end_tx channel after router connection loops ended: {err}");
        }
    }

    async fn connection_loop(
        context: RouterContext,
        listener_config: ListenerConfig,
        listener: TcpListener,
    ) {
        let acceptor = context.router().acceptor_for(&listener_config);
        let mut cancel_rx = context.router().cancel_tx.subscribe();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, addr) = match accept {
                        Ok((stream, addr)) => (stream, addr),
                        Err(_) => break,
                    };
                    tokio::spawn(Self::handle_connection(
                        context.clone(),
                        acceptor.clone(),
                        addr,
                        stream,
                    ));
                }
                _ = cancel_rx.recv() => {
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        context: RouterContext,
        acceptor: Arc<dyn Acceptor>,
        addr: SocketAddr,
        stream: TcpStream,
    ) {
        if let Err(err) = Self::start_connection(&context, acceptor, addr, stream).await {
            error!("Failed to start handling connection from {addr}: {err}");
        }
    }

    async fn start_connection(
        context: &RouterContext,
        acceptor: Arc<dyn Acceptor>,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<()> {
        debug!("Incoming TCP connection from {addr}");
        let acceptance = acceptor.accept(stream).await?;
        debug!(
            "WAMP connection established with {addr} using {:?}",
            acceptance.serializer
        );

        let serializer = new_serializer(acceptance.serializer);
        let connection = Connection::new();
        info!("Created connection {} for {addr}", connection.uuid());

        let service = Service::new(
            connection.uuid().to_string(),
            acceptance.transport,
            serializer,
        );
        connection.start(context.clone(), service);
        Ok(())
    }

    async fn shut_down(context: &RouterContext) {
        let realms = context
            .router()
            .realm_manager
            .uris()
            .cloned()
            .collect::<Vec<_>>();
        for uri in realms {
            if let Err(err) =
                Self::shut_down_realm(context, &uri, CloseReason::SystemShutdown).await
            {
                error!("Failed to shut down realm {uri}: {err}");
            }
        }
    }

    async fn shut_down_realm(
        context: &RouterContext,
        realm: &Uri,
        close_reason: CloseReason,
    ) -> Result<()> {
        let realm = match context.router().realm_manager.get(realm) {
            Some(realm) => realm,
            None => return Ok(()),
        };
        realm.lock().await.shut_down(close_reason).await
    }
}
