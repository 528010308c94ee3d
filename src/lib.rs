//! # wamphub
//!
//! **wamphub** is a router for the **Web Application Messaging Protocol**
//! (WAMP), written in Rust on top of [`tokio`](https://tokio.rs).
//!
//! ## What is WAMP?
//!
//! **WAMP** is an open standard, routed protocol that provides two messaging
//! patterns: Publish & Subscribe and routed Remote Procedure Calls. It is
//! intended to connect application components in distributed applications.
//! Peers talk to one another by establishing a session on a shared realm
//! through a shared router.
//!
//! The WAMP protocol specification is described
//! [here](https://wamp-proto.org/spec.html).
//!
//! ## The router
//!
//! The router is the trusted intermediary: it establishes sessions, keeps
//! realm-scoped topic subscriptions and procedure registrations, and routes
//! messages between peers. Two transport families are served, each with
//! JSON and MessagePack serialization:
//!
//! * **Raw socket**: length-prefixed binary framing directly over TCP,
//!   WAMP's native non-WebSocket transport.
//! * **WebSocket**: one WAMP message per WebSocket message, with the
//!   serializer chosen through `wamp.2.json` / `wamp.2.msgpack`
//!   subprotocol negotiation.
//!
//! Configure the router through a [`RouterConfig`][`crate::router::RouterConfig`]
//! and construct a [`Router`][`crate::router::Router`] directly. The router
//! runs in background tasks transparent to the caller and is interacted with
//! through the returned [`RouterHandle`][`crate::router::RouterHandle`].
//!
//! ```no_run
//! use wamphub::{
//!     core::uri::Uri,
//!     router::{
//!         ListenerConfig,
//!         RealmConfig,
//!         Router,
//!         RouterConfig,
//!         TransportKind,
//!     },
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = RouterConfig::default();
//!     config.realms.push(RealmConfig::new(
//!         "Test Realm",
//!         Uri::try_from("com.wamphub.realm.test")?,
//!     ));
//!     config.listeners.push(ListenerConfig::web_socket(
//!         "127.0.0.1".parse()?,
//!         8080,
//!     ));
//!     config.listeners.push(ListenerConfig::raw_socket(
//!         "127.0.0.1".parse()?,
//!         8081,
//!     ));
//!
//!     let router = Router::new(config)?;
//!
//!     // Start the router in background tasks.
//!     let router_handle = router.start().await?;
//!
//!     // Let the router run for as long as desired...
//!
//!     // Cancel and wait for the router to terminate.
//!     router_handle.cancel()?;
//!     router_handle.join().await
//! }
//! ```

pub mod auth;
pub mod core;
pub mod message;
pub mod router;
pub mod serializer;
pub mod transport;
