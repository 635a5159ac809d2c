//! Error types for the transport module.

use castwire_codec::FormatError;
use castwire_ipc::FailureReason;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server could not be reached.
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Connection lost after it was established.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A protocol step ran out of time.
    #[error("Timed out during {0}")]
    Timeout(String),

    /// Invalid destination URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The operation was cancelled by disconnect().
    #[error("Cancelled")]
    Cancelled,

    /// Not connected.
    #[error("Not connected")]
    NotConnected,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Muxing error.
    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// The server spoke the protocol but refused or confused us.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Handshake version or capability mismatch.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Credentials missing or refused.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Bytes that do not parse as the protocol.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The server rejected a command.
    #[error("Rejected by server: {0}")]
    Rejected(String),
}

/// Errors raised by muxers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// The container cannot carry this codec.
    #[error("Unsupported codec for {container}: {codec}")]
    UnsupportedCodec {
        container: &'static str,
        codec: String,
    },

    /// A frame arrived before its stream was described.
    #[error("No {0} configuration set")]
    MissingConfig(&'static str),

    /// Stream metadata could not be encoded.
    #[error("Metadata encoding failed: {0}")]
    Metadata(String),

    /// Codec parameters could not be packaged.
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Why connect() failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The server could not be reached.
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// The server refused the handshake.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A handshake or auth step timed out.
    #[error("Timed out during {0}")]
    Timeout(String),

    /// Invalid destination URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A session is already live.
    #[error("Already connected")]
    AlreadyConnected,

    /// disconnect() was called while connecting.
    #[error("Connection cancelled")]
    Cancelled,

    /// The server rejected a command or sent garbage.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Failure reason reported to observers.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Unreachable(message) => FailureReason::Unreachable {
                message: message.clone(),
            },
            Self::HandshakeRejected(message) => FailureReason::HandshakeRejected {
                message: message.clone(),
            },
            Self::AuthenticationFailed(message) => FailureReason::AuthenticationFailed {
                message: message.clone(),
            },
            Self::Timeout(stage) => FailureReason::Timeout {
                stage: stage.clone(),
            },
            other => FailureReason::Protocol {
                message: other.to_string(),
            },
        }
    }
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(message) => Self::Unreachable(message),
            TransportError::ConnectionLost(message) => Self::Unreachable(message),
            TransportError::Io(e) => Self::Unreachable(e.to_string()),
            TransportError::Timeout(stage) => Self::Timeout(stage),
            TransportError::InvalidUrl(message) => Self::InvalidUrl(message),
            TransportError::Cancelled => Self::Cancelled,
            TransportError::NotConnected => Self::Protocol("not connected".into()),
            TransportError::Protocol(ProtocolError::HandshakeRejected(message)) => {
                Self::HandshakeRejected(message)
            }
            TransportError::Protocol(ProtocolError::AuthenticationFailed(message)) => {
                Self::AuthenticationFailed(message)
            }
            TransportError::Protocol(other) => Self::Protocol(other.to_string()),
            TransportError::Mux(e) => Self::Protocol(e.to_string()),
        }
    }
}
