//! Error types for the tunnel, hand-off and SOCKS5 layers.

use thiserror::Error;

/// Result type alias for linkshare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tunnelling or relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// A bounded wait expired
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Message received out of the expected handshake state, or malformed
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// SOCKS version byte mismatch
    #[error("SOCKS version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this side speaks
        expected: u8,
        /// Version byte the peer sent
        actual: u8,
    },

    /// Client offered no method we accept
    #[error("no acceptable SOCKS5 authentication methods")]
    NoAcceptableMethods,

    /// SOCKS5 command other than CONNECT
    #[error("SOCKS5 command not supported: 0x{0:02x}")]
    CommandNotSupported(u8),

    /// SOCKS5 address type outside IPv4/domain/IPv6
    #[error("SOCKS5 address type not supported: 0x{0:02x}")]
    AddressTypeNotSupported(u8),

    /// CONNECT target could not be reached; `reply` is the SOCKS5 code sent back
    #[error("cannot reach {target} (reply 0x{reply:02x})")]
    TargetUnreachable {
        /// Requested destination, as the client named it
        target: String,
        /// SOCKS5 reply code
        reply: u8,
    },

    /// Authenticator refused to (re)acquire the identity
    #[error("hand-off failed: {0}")]
    HandoffFailed(String),

    /// Data connection named a session that is not established
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Client gave up connecting to the server
    #[error("could not reach tunnel server after {0} attempts")]
    RetriesExhausted(u32),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Task was cancelled by shutdown or eviction
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this error means the peer broke the wire contract
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::VersionMismatch { .. }
                | Error::UnknownSession(_)
                | Error::AddressTypeNotSupported(_)
        )
    }

    /// Check if the client connect loop may retry after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Network(_))
    }
}
