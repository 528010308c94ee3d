use crate::core::types::{
    Dictionary,
    HashSet,
    Value,
};

/// A role a peer can announce in its HELLO message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl PeerRole {
    pub fn key_for_details(&self) -> &str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

impl TryFrom<&str> for PeerRole {
    type Error = &'static str;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err("unknown peer role"),
        }
    }
}

/// A role implemented by the router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouterRole {
    // Supports RPC calls.
    Dealer,
    // Supports pub/sub.
    Broker,
}

impl RouterRole {
    pub fn key_for_details(&self) -> &str {
        match self {
            Self::Dealer => "dealer",
            Self::Broker => "broker",
        }
    }
}

/// Reads the peer's announced roles from HELLO details.
///
/// Unknown role names are ignored; the session layer rejects a HELLO that
/// announces no known role at all.
pub fn peer_roles_from_details(details: &Dictionary) -> HashSet<PeerRole> {
    details
        .get("roles")
        .and_then(|roles| roles.dictionary())
        .map(|roles| {
            roles
                .keys()
                .filter_map(|role| PeerRole::try_from(role.as_str()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Builds the `roles` entry of WELCOME details from the router's roles.
pub fn router_roles_to_details<I>(roles: I) -> Value
where
    I: IntoIterator<Item = RouterRole>,
{
    let mut dictionary = Dictionary::default();
    for role in roles {
        dictionary.insert(
            role.key_for_details().to_owned(),
            Value::Dictionary(Dictionary::default()),
        );
    }
    Value::Dictionary(dictionary)
}

#[cfg(test)]
mod roles_test {
    use crate::core::{
        roles::{
            peer_roles_from_details,
            PeerRole,
        },
        types::{
            Dictionary,
            HashSet,
            Value,
        },
    };

    #[test]
    fn reads_peer_roles_from_hello_details() {
        let details = Dictionary::from_iter([(
            "roles".to_owned(),
            Value::Dictionary(Dictionary::from_iter([
                ("caller".to_owned(), Value::Dictionary(Dictionary::default())),
                (
                    "subscriber".to_owned(),
                    Value::Dictionary(Dictionary::default()),
                ),
                ("banana".to_owned(), Value::Dictionary(Dictionary::default())),
            ])),
        )]);
        assert_eq!(
            peer_roles_from_details(&details),
            HashSet::from_iter([PeerRole::Caller, PeerRole::Subscriber])
        );
    }

    #[test]
    fn missing_roles_read_as_empty() {
        assert!(peer_roles_from_details(&Dictionary::default()).is_empty());
    }
}
