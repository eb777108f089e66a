pub mod config;
pub mod connect;
pub mod connection;
pub mod error;
pub mod message;
pub mod ping;
pub mod roles;
pub mod test_util;
pub mod transport;
pub mod wire;
