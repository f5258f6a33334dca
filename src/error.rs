//! Error types for the proxy.

use std::io;

use thiserror::Error;

use crate::protocol::Reply;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a SOCKS5 client.
#[derive(Error, Debug)]
pub enum Error {
    /// Frame ended before all of its fields were present
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Protocol version other than 5
    #[error("unsupported socks version 0x{0:02x}")]
    Version(u8),

    /// Reserved field carried a non-zero value
    #[error("reserved field must be 0x00, got 0x{0:02x}")]
    Reserved(u8),

    /// Unknown request command
    #[error("unsupported command 0x{0:02x}")]
    Command(u8),

    /// Unknown address type
    #[error("unsupported address type 0x{0:02x}")]
    AddressType(u8),

    /// Domain name that is not UTF-8 or longer than 255 bytes
    #[error("invalid domain name")]
    Domain,

    /// UDP datagram with a non-zero fragment number
    #[error("fragmented datagram (frag 0x{0:02x})")]
    Fragmented(u8),

    /// Hostname lookup failed
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Hostname resolved to nothing
    #[error("no address found for {0}")]
    NoAddress(String),

    /// Socket level failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid startup configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// The reply code a client receives when its request fails with this error.
    pub fn reply(&self) -> Reply {
        match self {
            Error::AddressType(_) => Reply::AddressTypeNotSupported,
            Error::Command(_) => Reply::CommandNotSupported,
            Error::Resolve { .. } | Error::NoAddress(_) => Reply::HostUnreachable,
            Error::Io(err) => Reply::from(err),
            _ => Reply::GeneralFailure,
        }
    }

    /// Check if this error came from the client sending a bad frame
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. }
                | Error::Version(_)
                | Error::Reserved(_)
                | Error::Command(_)
                | Error::AddressType(_)
                | Error::Domain
                | Error::Fragmented(_)
        )
    }
}
