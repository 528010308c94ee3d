use anyhow::Result;
use async_trait::async_trait;

use crate::message::message::HelloMessage;

/// The identity established for a session when it joins a realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authentication ID of the session.
    pub id: String,
    /// The authentication role of the session.
    pub role: String,
    /// The method that established the identity.
    pub method: String,
}

/// Hook for authenticating a session as it joins a realm.
///
/// Invoked with the peer's HELLO message; a returned error aborts the session
/// before it is attached to the realm.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, message: &HelloMessage) -> Result<Identity>;
}

/// The default authenticator: every session is admitted anonymously under a
/// transient, random authentication ID.
#[derive(Debug, Default)]
pub struct AnonymousAuthenticator {}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _: &HelloMessage) -> Result<Identity> {
        Ok(Identity {
            id: format!("anonymous-{:016x}", rand::random::<u64>()),
            role: "anonymous".to_owned(),
            method: "anonymous".to_owned(),
        })
    }
}

#[cfg(test)]
mod authenticator_test {
    use crate::{
        auth::{
            AnonymousAuthenticator,
            Authenticator,
        },
        message::message::HelloMessage,
    };

    #[tokio::test]
    async fn admits_any_hello_anonymously() {
        let authenticator = AnonymousAuthenticator::default();
        let identity = authenticator
            .authenticate(&HelloMessage::default())
            .await
            .unwrap();
        assert!(identity.id.starts_with("anonymous-"));
        assert_eq!(identity.role, "anonymous");
        assert_eq!(identity.method, "anonymous");
    }
}
