use std::sync::Arc;

use anyhow::Result;
use futures_util::lock::MutexGuard;

use crate::{
    core::{
        error::InteractionError,
        id::Id,
        uri::Uri,
    },
    router::{
        realm::{
            Realm,
            RealmSession,
        },
        router::Router,
    },
};

/// The context of a task running for a router.
///
/// Used to share ownership of the router across many tasks.
pub struct RouterContext {
    router: Arc<Router>,
}

impl RouterContext {
    /// Constructs a new context wrapper around a router.
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &Router {
        self.router.as_ref()
    }

    /// Locks the named realm for exclusive access.
    pub async fn realm_context(&self, realm: &Uri) -> Result<RealmContext<'_>> {
        let realm = self
            .router
            .realm_manager
            .get(realm)
            .ok_or(InteractionError::NoSuchRealm)?;
        Ok(RealmContext {
            context: self,
            realm: realm.lock().await,
        })
    }
}

impl Clone for RouterContext {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
        }
    }
}

/// Exclusive access to one realm, alongside the router that owns it.
///
/// Broker and dealer operations run entirely under this guard, which is what
/// keeps registry updates and fan-out atomic with respect to other sessions.
pub struct RealmContext<'router> {
    context: &'router RouterContext,
    realm: MutexGuard<'router, Realm>,
}

impl<'router> RealmContext<'router> {
    pub fn router(&self) -> &Router {
        self.context.router()
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn realm_mut(&mut self) -> &mut Realm {
        &mut self.realm
    }

    /// Looks up an attached session by ID.
    ///
    /// A stale ID is a cheap miss: sessions detach from the realm when their
    /// transport goes away.
    pub fn session(&self, session: Id) -> Option<&RealmSession> {
        self.realm.sessions.get(&session)
    }
}
