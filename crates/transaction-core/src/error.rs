use thiserror::Error;

use rvoip_stack_transport::TransportKey;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the transaction layer API.
///
/// Network and DNS failures are not errors at this level: they are turned
/// into events and handled by the owning transaction.
#[derive(Error, Debug)]
pub enum Error {
    /// Error originating from the transport crate
    #[error("SIP transport error: {0}")]
    Transport(#[from] rvoip_stack_transport::Error),

    /// No transport is registered under the given key
    #[error("Unknown transport key: {0}")]
    UnknownTransport(TransportKey),

    /// The message cannot be handed to the transaction layer
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The stack has been shut down
    #[error("SIP stack is shut down")]
    Shutdown,

    /// Logging could not be initialized
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::config(e.to_string())
    }
}
