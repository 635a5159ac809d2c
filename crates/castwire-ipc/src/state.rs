//! Connection state machine types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a connection ended up in [`ConnectionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The server could not be reached.
    Unreachable { message: String },

    /// The server refused the protocol handshake.
    HandshakeRejected { message: String },

    /// The server refused our credentials, or asked for credentials we lack.
    AuthenticationFailed { message: String },

    /// A handshake or auth step ran out of time.
    Timeout { stage: String },

    /// The transport failed after the connection was established.
    ConnectionLost { message: String },

    /// The server sent something we could not understand or rejected a command.
    Protocol { message: String },
}

impl FailureReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::Unreachable { message } => format!("Server unreachable: {message}"),
            Self::HandshakeRejected { message } => format!("Handshake rejected: {message}"),
            Self::AuthenticationFailed { message } => {
                format!("Authentication failed: {message}")
            }
            Self::Timeout { stage } => format!("Timed out during {stage}"),
            Self::ConnectionLost { message } => format!("Connection lost: {message}"),
            Self::Protocol { message } => format!("Protocol error: {message}"),
        }
    }

    /// Whether reconnecting with the same settings could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout { .. } | Self::ConnectionLost { .. }
        )
    }
}

/// The state of one streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing started yet.
    #[default]
    Idle,

    /// Opening the transport.
    Connecting,

    /// Exchanging protocol handshake bytes.
    Handshaking,

    /// Answering a server authentication challenge.
    Authenticating,

    /// Publishing accepted, waiting for the first frame.
    Ready,

    /// Media is flowing.
    Streaming,

    /// Draining the send queue before closing.
    Closing,

    /// Closed cleanly.
    Closed,

    /// Ended with an error.
    Failed { reason: FailureReason },
}

impl ConnectionState {
    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Handshaking => "Handshaking",
            Self::Authenticating => "Authenticating",
            Self::Ready => "Ready",
            Self::Streaming => "Streaming",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Closed and Failed cannot be left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }

    /// Returns true while connect() is still in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Handshaking | Self::Authenticating
        )
    }

    /// Returns true once publishing has been accepted.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Ready | Self::Streaming)
    }

    /// Whether frames submitted now are queued rather than dropped.
    pub fn accepts_frames(&self) -> bool {
        self.is_connecting() || self.is_connected()
    }

    /// Returns true if failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Closed | Failed { .. }, _) => false,
            (_, Failed { .. }) => !matches!(self, Idle | Closing),
            (Idle, Connecting | Closed) => true,
            (Connecting, Handshaking | Closing) => true,
            (Handshaking, Authenticating | Ready | Closing) => true,
            (Authenticating, Ready | Closing) => true,
            (Ready, Streaming | Closing) => true,
            (Streaming, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

/// Attempted a transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}
