//! A SOCKS5 proxy server (RFC 1928) supporting CONNECT and UDP ASSOCIATE
//! without authentication.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod resolver;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use server::SOCKS5Server;
