//! Error types for Kestrel

use std::fmt;

/// Unified error type for Kestrel applications.
#[derive(Debug)]
pub enum KestrelError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed input, unexpected message, negotiation failure)
    Protocol(String),

    /// Security error (host key rejected, integrity check failed)
    Security(String),

    /// A bounded wait expired
    Timeout(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::Io(e) => write!(f, "IO error: {}", e),
            KestrelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KestrelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KestrelError::Security(msg) => write!(f, "Security error: {}", msg),
            KestrelError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            KestrelError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KestrelError::Io(e) => Some(e),
            KestrelError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        KestrelError::Io(err)
    }
}

/// Result type for Kestrel operations
pub type KestrelResult<T> = Result<T, KestrelError>;
