//! Error handling module
//!
//! Defines the error types shared by the transport, server and client layers.

use std::io;

use thiserror::Error;

/// Main error type for gamewire
#[derive(Error, Debug)]
pub enum GamewireError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    Timeout,

    #[error("Connection refused")]
    Refused,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Could not resolve host: {0}")]
    Unresolved(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Socket not connected")]
    NotConnected,
}

/// Wire-protocol errors
///
/// Any of these drops the offending connection; none of them are surfaced to
/// other connections or to application handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request too large: {size} bytes (max: {max})")]
    RequestTooLarge { size: usize, max: usize },

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("Client frame is not masked")]
    UnmaskedClientFrame,

    #[error("Server frame is masked")]
    MaskedServerFrame,

    #[error("Reserved bits set in frame header")]
    ReservedBits,

    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u8),

    #[error("Invalid control frame: {0}")]
    InvalidControlFrame(String),

    #[error("Unexpected continuation frame")]
    UnexpectedContinuation,

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Result type alias for gamewire operations
pub type Result<T> = std::result::Result<T, GamewireError>;

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::Refused;
        assert_eq!(err.to_string(), "Connection refused");

        let err = ProtocolError::InvalidOpcode(3);
        assert_eq!(err.to_string(), "Invalid opcode: 3");

        let err = ProtocolError::PacketTooLarge {
            size: 100,
            max: 10,
        };
        assert_eq!(err.to_string(), "Packet too large: 100 bytes (max: 10)");

        let err = NetworkError::Bind {
            port: 80,
            reason: "in use".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to bind port 80: in use");
    }

    #[test]
    fn test_error_conversion() {
        let err: GamewireError = ProtocolError::ReservedBits.into();
        assert!(matches!(
            err,
            GamewireError::Protocol(ProtocolError::ReservedBits)
        ));

        let io_err: io::Error = ProtocolError::UnmaskedClientFrame.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
    }
}
