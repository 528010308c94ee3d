pub mod close;
pub mod error;
pub mod id;
pub mod roles;
pub mod service;
pub mod stream;
pub mod types;
pub mod uri;
