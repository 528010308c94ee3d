use std::{
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    future::join_all,
    lock::Mutex,
};
use log::warn;

use crate::{
    auth::{
        AnonymousAuthenticator,
        Authenticator,
    },
    core::{
        close::CloseReason,
        id::Id,
        types::HashMap,
        uri::Uri,
    },
    router::{
        procedure::ProcedureManager,
        session::SessionHandle,
        topic::TopicManager,
    },
};

/// Configuration for a realm hosted on a router.
#[derive(Clone)]
pub struct RealmConfig {
    pub name: String,
    pub uri: Uri,
    /// Authentication hook for sessions joining the realm.
    ///
    /// Every session is admitted anonymously when unset.
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl RealmConfig {
    pub fn new<S>(name: S, uri: Uri) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            uri,
            authenticator: None,
        }
    }
}

impl Debug for RealmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmConfig")
            .field("name", &self.name)
            .field("uri", &self.uri)
            .finish()
    }
}

/// A session attached to a realm.
pub struct RealmSession {
    pub session: SessionHandle,
}

/// A realm, the routing namespace sessions attach to.
///
/// Owns the broker and dealer state for the namespace. All access goes
/// through the realm's lock, so registry mutations never race.
pub struct Realm {
    pub config: RealmConfig,
    pub authenticator: Arc<dyn Authenticator>,
    pub sessions: HashMap<Id, RealmSession>,
    pub topic_manager: TopicManager,
    pub procedure_manager: ProcedureManager,
}

impl Realm {
    pub fn new(config: RealmConfig) -> Self {
        let authenticator = config
            .authenticator
            .clone()
            .unwrap_or_else(|| Arc::new(AnonymousAuthenticator::default()));
        Self {
            config,
            authenticator,
            sessions: HashMap::default(),
            topic_manager: TopicManager::default(),
            procedure_manager: ProcedureManager::default(),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.config.uri
    }

    /// Closes every attached session and waits (bounded) for them to drain.
    pub async fn shut_down(&mut self, close_reason: CloseReason) -> Result<()> {
        let mut closed_rxs = Vec::default();
        for (id, session) in &self.sessions {
            if let Err(err) = session.session.close(close_reason) {
                warn!("Failed to close session {id}: {err}");
                continue;
            }
            closed_rxs.push(session.session.closed_session_rx());
        }

        tokio::select! {
            _ = join_all(closed_rxs.iter_mut().map(|rx| rx.recv())) => {},
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                return Err(Error::msg("timed out waiting for sessions to close cleanly"));
            }
        }

        self.sessions.clear();
        Ok(())
    }
}

/// The registry of realms on a router.
///
/// Realms are created at startup and never change afterwards, so lookups
/// need no lock of their own; each realm carries its own.
#[derive(Default)]
pub struct RealmManager {
    realms: HashMap<Uri, Mutex<Realm>>,
}

impl RealmManager {
    pub fn get(&self, uri: &Uri) -> Option<&Mutex<Realm>> {
        self.realms.get(uri)
    }

    pub fn insert(&mut self, realm: Realm) {
        let uri = realm.uri().clone();
        self.realms.insert(uri, realm.into());
    }

    pub fn uris(&self) -> impl Iterator<Item = &Uri> {
        self.realms.keys()
    }
}
