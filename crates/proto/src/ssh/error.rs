//! Error types for the SSH transport and channel layers.
//!
//! Errors fall into two scopes. Transport-scope errors (protocol violations,
//! corrupt packets, negotiation and host key failures, lost connections) are
//! fatal to the session and are broadcast to every channel and blocked
//! caller. Channel-scope errors (an open refusal, a closed channel, a timed
//! out wait) only affect the call that produced them.

use crate::ssh::message::DisconnectReason;
use kestrel_platform::KestrelError;
use std::fmt;

/// Result type for SSH operations
pub type Result<T> = std::result::Result<T, Error>;

/// SSH protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed, oversized or out-of-sequence input from the peer
    ProtocolViolation(String),

    /// MAC or AEAD tag mismatch on an inbound packet
    CorruptPacket(String),

    /// Message type byte with no registered decoder
    UnsupportedMessage(u8),

    /// No common algorithm for a required KEXINIT category
    AlgorithmNegotiation {
        /// Category that failed (e.g. "encryption client->server")
        category: &'static str,
        /// Client proposal for that category
        client: String,
        /// Server proposal for that category
        server: String,
    },

    /// Server signature invalid or host key rejected by the application
    HostKeyVerification(String),

    /// Transport I/O failure or peer disconnect
    ConnectionLost(String),

    /// A bounded wait expired
    OperationTimedOut(String),

    /// Peer answered CHANNEL_OPEN with CHANNEL_OPEN_FAILURE
    ChannelOpenRefused {
        /// Numeric reason code from the peer
        reason: u32,
        /// Human-readable description from the peer
        description: String,
    },

    /// Operation on a channel that has already been closed
    ChannelClosed(u32),

    /// Invalid configuration, rejected before any I/O
    Config(String),
}

impl Error {
    /// Returns `true` if this error tears down the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::CorruptPacket(_)
                | Error::AlgorithmNegotiation { .. }
                | Error::HostKeyVerification(_)
                | Error::ConnectionLost(_)
        )
    }

    /// Disconnect reason sent to the peer when this error ends the session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Error::CorruptPacket(_) => DisconnectReason::MacError,
            Error::AlgorithmNegotiation { .. } => DisconnectReason::KeyExchangeFailed,
            Error::HostKeyVerification(_) => DisconnectReason::HostKeyNotVerifiable,
            Error::ConnectionLost(_) => DisconnectReason::ConnectionLost,
            Error::OperationTimedOut(_) | Error::Config(_) => DisconnectReason::ByApplication,
            Error::ProtocolViolation(_)
            | Error::UnsupportedMessage(_)
            | Error::ChannelOpenRefused { .. }
            | Error::ChannelClosed(_) => DisconnectReason::ProtocolError,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Error::CorruptPacket(msg) => write!(f, "Corrupt packet: {}", msg),
            Error::UnsupportedMessage(code) => {
                write!(f, "Unsupported message type: {}", code)
            }
            Error::AlgorithmNegotiation {
                category,
                client,
                server,
            } => write!(
                f,
                "No common {} algorithm (client: [{}], server: [{}])",
                category, client, server
            ),
            Error::HostKeyVerification(msg) => {
                write!(f, "Host key verification failed: {}", msg)
            }
            Error::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Error::OperationTimedOut(op) => write!(f, "Operation timed out: {}", op),
            Error::ChannelOpenRefused {
                reason,
                description,
            } => write!(f, "Channel open refused ({}): {}", reason, description),
            Error::ChannelClosed(id) => write!(f, "Channel {} is closed", id),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::OperationTimedOut(err.to_string()),
            _ => Error::ConnectionLost(err.to_string()),
        }
    }
}

impl From<Error> for KestrelError {
    fn from(err: Error) -> Self {
        match err {
            Error::Config(msg) => KestrelError::Config(msg),
            Error::OperationTimedOut(op) => KestrelError::Timeout(op),
            Error::CorruptPacket(_) | Error::HostKeyVerification(_) => {
                KestrelError::Security(err.to_string())
            }
            Error::ConnectionLost(msg) => KestrelError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                msg,
            )),
            other => KestrelError::Protocol(other.to_string()),
        }
    }
}
