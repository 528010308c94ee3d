pub mod client;
pub mod setup;
