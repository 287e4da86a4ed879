use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::tuple::ConnectionId;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transport layer
#[derive(Error, Debug)]
pub enum Error {
    /// A message could not be decoded
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// A stream message exceeds a size limit
    #[error("Message too large: {size} bytes, limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// A URI could not be parsed
    #[error("Invalid URI '{uri}': {message}")]
    InvalidUri { uri: String, message: String },

    /// Binding a listening socket failed
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The transport was shut down
    #[error("Transport closed")]
    TransportClosed,

    /// No connection with this id is known
    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// A DNS lookup produced no usable records
    #[error("DNS lookup for {target} failed: {message}")]
    Dns { target: String, message: String },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    /// Create an invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// Create a DNS error
    pub fn dns(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dns {
            target: target.into(),
            message: message.into(),
        }
    }
}
