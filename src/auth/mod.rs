mod authenticator;

pub use authenticator::{
    AnonymousAuthenticator,
    Authenticator,
    Identity,
};
