use anyhow::Error;
use thiserror::Error;

use crate::core::uri::{
    InvalidUri,
    Uri,
};

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    ///
    /// WAMP defines standard URIs for not finding specific resource types.
    /// This error should only be used when the standard URI cannot be used.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed based on process configuration or the
    /// peer's announced roles.
    #[error("{0}")]
    NotAllowed(String),
    /// Some internal error occurred.
    ///
    /// Should only be used when there is no other error variant that
    /// describes the error, since the message is very vague and not very
    /// useful for debugging.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are clearly defined in the WAMP standard and are
/// reserved for errors that peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A URI in the message does not match the URI grammar.
    #[error("invalid URI")]
    InvalidUri,
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// The call was canceled before a result could be delivered.
    #[error("canceled")]
    Canceled,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::InvalidUri => "invalid_uri",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::Canceled => "canceled",
        }
    }
}

impl Uri {
    /// The `wamp.error.*` URI describing the error.
    pub fn for_error(error: &Error) -> Uri {
        if let Some(error) = error.downcast_ref::<InteractionError>() {
            Uri::from_known(format!("wamp.error.{}", error.uri_component()))
        } else if let Some(error) = error.downcast_ref::<BasicError>() {
            Uri::from_known(format!("wamp.error.{}", error.uri_component()))
        } else if error.downcast_ref::<InvalidUri>().is_some() {
            Uri::from_known("wamp.error.invalid_uri")
        } else {
            Uri::from_known("wamp.error.internal")
        }
    }
}

#[cfg(test)]
mod error_test {
    use anyhow::Error;

    use crate::core::{
        error::{
            BasicError,
            InteractionError,
        },
        uri::Uri,
    };

    #[test]
    fn maps_errors_to_uris() {
        assert_eq!(
            Uri::for_error(&Error::new(InteractionError::NoSuchRealm)).as_ref(),
            "wamp.error.no_such_realm"
        );
        assert_eq!(
            Uri::for_error(&Error::new(InteractionError::ProtocolViolation(
                "oops".to_owned()
            )))
            .as_ref(),
            "wamp.error.protocol_violation"
        );
        assert_eq!(
            Uri::for_error(&Error::new(InteractionError::InvalidUri)).as_ref(),
            "wamp.error.invalid_uri"
        );
        assert_eq!(
            Uri::for_error(&Error::new(BasicError::NotAllowed("nope".to_owned()))).as_ref(),
            "wamp.error.not_allowed"
        );
        assert_eq!(
            Uri::for_error(&Error::msg("anything else")).as_ref(),
            "wamp.error.internal"
        );
    }
}
