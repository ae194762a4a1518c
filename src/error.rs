//! Error types for the tunnel engine.

use thiserror::Error;

use crate::engine::errno::{self, ErrorClass};
use crate::engine::HandlerId;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel endpoint.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The remote side closed its half of the connection
    #[error("connection closed by peer")]
    PeerClosed,

    /// Malformed SOCKS5 or tunnel data
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// SOCKS5 request carried a command this engine does not serve
    #[error("unknown SOCKS5 command {0:#04x}")]
    UnknownCommand(u8),

    /// SOCKS5 header carried an address type outside IPv4/domain/IPv6
    #[error("unknown SOCKS5 address type {0:#04x}")]
    UnknownAddressType(u8),

    /// DNS resolution failed or returned nothing
    #[error("cannot resolve {host}: {reason}")]
    Resolve {
        /// Host that was looked up
        host: String,
        /// Resolver's explanation
        reason: String,
    },

    /// Transport codec failure (bad tag, bad chunk length)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Handler registered twice with the multiplexer
    #[error("handler {0} already registered")]
    AlreadyRegistered(HandlerId),

    /// Operation attempted on a handler that has been torn down
    #[error("handler {0} has been shut down")]
    Closed(HandlerId),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new resolution error
    pub fn resolve(host: impl Into<String>, reason: impl ToString) -> Self {
        Error::Resolve {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is an ordinary end of a connection.
    ///
    /// Such errors are logged quietly; everything else is worth an error line.
    pub fn is_quiet(&self) -> bool {
        match self {
            Error::PeerClosed => true,
            Error::Network(e) => errno::classify(e) != ErrorClass::Fatal,
            _ => false,
        }
    }

    /// Check if this error indicates misuse of the handler API
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Error::AlreadyRegistered(_) | Error::Closed(_))
    }

    /// Check if the client or tunnel peer sent something we cannot parse
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::UnknownCommand(_) | Error::UnknownAddressType(_)
        )
    }
}
