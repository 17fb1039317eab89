//! Error types for the relay daemon.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying traffic.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Cipher name not recognized by the cipher boundary
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Malformed SOCKS address or handshake message
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The control connection requested a UDP association instead of a relay
    #[error("UDP associate")]
    UdpAssociate,

    /// Copy was aborted because the opposite direction finished
    #[error("i/o timeout")]
    Timeout,

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Time-series store rejected a request or was unreachable
    #[error("storage error: {0}")]
    Storage(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new address error
    pub fn address(msg: impl Into<String>) -> Self {
        Error::InvalidAddress(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Check if this error is the expected result of forced teardown.
    ///
    /// I/O errors of kind `TimedOut` or `WouldBlock` count as well, since
    /// socket read/write timeouts surface that way.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Network(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error is the UDP-associate sentinel.
    pub fn is_udp_associate(&self) -> bool {
        matches!(self, Error::UdpAssociate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedCipher("rc4".into());
        assert_eq!(err.to_string(), "unsupported cipher: rc4");

        let err = Error::Timeout;
        assert_eq!(err.to_string(), "i/o timeout");
    }

    #[test]
    fn test_timeout_classification() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::Network(std::io::ErrorKind::TimedOut.into()).is_timeout());
        assert!(!Error::Network(std::io::ErrorKind::ConnectionReset.into()).is_timeout());
        assert!(!Error::UdpAssociate.is_timeout());
    }

    #[test]
    fn test_udp_associate_sentinel() {
        assert!(Error::UdpAssociate.is_udp_associate());
        assert!(!Error::address("bad").is_udp_associate());
    }
}
