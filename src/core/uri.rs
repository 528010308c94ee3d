use std::{
    fmt::Display,
    sync::LazyLock,
};

use regex::Regex;
use serde::{
    de::Visitor,
    Deserialize,
    Serialize,
};
use thiserror::Error;

/// Error for an invalid URI.
#[derive(Debug, Error)]
#[error("invalid URI")]
pub struct InvalidUri;

/// Validates a URI: non-empty components free of whitespace, `.`, and `#`,
/// joined by single dots.
pub fn validate_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[^\s.#]+(\.[^\s.#]+)*$").unwrap());
    if !RE.is_match(uri.as_ref()) {
        return Err(InvalidUri);
    }
    Ok(())
}

/// A uniform resource identifier, used in many aspects of WAMP messaging for
/// identifying resources, such as realms, topics, and procedures.
///
/// Equality and hashing are byte-wise. Decoding off the wire accepts any
/// string; validation happens where the URI is consumed, so that a malformed
/// topic or procedure produces a request-scoped error instead of tearing down
/// the whole session.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Constructs a URI directly from a value known to be valid, skipping
    /// validation.
    pub(crate) fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// Validates the URI against the component grammar.
    pub fn validate(&self) -> Result<(), InvalidUri> {
        validate_uri(&self.0)
    }

    /// Splits the URI into its components.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(Uri::from_known(v))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

#[cfg(test)]
mod uri_test {
    use crate::core::uri::{
        validate_uri,
        Uri,
    };

    #[test]
    fn validates_uris() {
        assert_matches::assert_matches!(validate_uri("com"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com123"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com.example.topic"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com.example.TOPIC"), Ok(()));
        assert_matches::assert_matches!(validate_uri("com.1"), Ok(()));
        assert_matches::assert_matches!(validate_uri(""), Err(_));
        assert_matches::assert_matches!(validate_uri("."), Err(_));
        assert_matches::assert_matches!(validate_uri(".."), Err(_));
        assert_matches::assert_matches!(validate_uri("com..topic"), Err(_));
        assert_matches::assert_matches!(validate_uri(".com.example.topic1"), Err(_));
        assert_matches::assert_matches!(validate_uri("com.example.topic."), Err(_));
        assert_matches::assert_matches!(validate_uri("com.example#"), Err(_));
        assert_matches::assert_matches!(validate_uri("com.ex ample.topic"), Err(_));
        assert_matches::assert_matches!(validate_uri("com.\texample"), Err(_));
    }

    #[test]
    fn deserialization_defers_validation() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com..broken""#), Ok(uri) => {
            assert_matches::assert_matches!(uri.validate(), Err(_));
        });
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com.example.topic""#), Ok(uri) => {
            assert_matches::assert_matches!(uri.validate(), Ok(()));
        });
    }

    #[test]
    fn splits_into_components() {
        let uri = Uri::try_from("com.example.topic").unwrap();
        assert_eq!(
            uri.split().collect::<Vec<_>>(),
            Vec::from_iter(["com", "example", "topic"])
        );
    }
}
