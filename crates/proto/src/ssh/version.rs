//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification line before any binary packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may send other lines before its identification line; they are
//! logged and skipped. The exact identification strings (without CR LF) feed
//! the exchange hash, so [`Version`] keeps the line verbatim.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes including CR LF
//! - At most [`MAX_PRE_BANNER_LINES`] lines before the identification line
//! - No NUL bytes
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::version::Version;
//!
//! let version = Version::new("Kestrel_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Kestrel_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! assert_eq!(parsed.comments(), Some("Ubuntu-3"));
//! ```

use crate::ssh::error::{Error, Result};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum length of an identification line including CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines the server may send before its identification.
pub const MAX_PRE_BANNER_LINES: usize = 50;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
    line: String,
}

impl Version {
    /// Creates a protocol 2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let line = match comments {
            Some(c) => format!("SSH-2.0-{} {}", software, c),
            None => format!("SSH-2.0-{}", software),
        };
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            line,
        }
    }

    /// Default client identification, `SSH-2.0-Kestrel_<version>`.
    pub fn default_client() -> Self {
        Self::new(&format!("Kestrel_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolViolation`] if the line is too long, contains NUL,
    /// does not start with `SSH-`, or announces a protocol other than `2.0`
    /// or `1.99`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() + 2 > MAX_VERSION_LENGTH {
            return Err(Error::protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len() + 2,
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(Error::protocol("Version string contains null byte"));
        }
        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            Error::protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;

        let (proto_version, tail) = rest
            .split_once('-')
            .ok_or_else(|| Error::protocol(format!("Invalid version string format: '{}'", line)))?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(Error::protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match tail.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (tail, None),
        };
        if software_version.is_empty() {
            return Err(Error::protocol("Version string has empty software version"));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: software_version.to_string(),
            comments,
            line: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_9.6").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification string exactly as exchanged, without CR LF.
    pub fn identification(&self) -> &str {
        &self.line
    }

    /// Wire format with CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.line).into_bytes()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Sends `local` and reads the peer's identification line.
///
/// The reader must be buffered so that bytes following the identification
/// line stay available for the packet codec.
pub async fn exchange<R, W>(reader: &mut R, writer: &mut W, local: &Version) -> Result<Version>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&local.to_wire_format()).await?;
    writer.flush().await?;
    debug!(version = %local, "Sent identification");

    for _ in 0..=MAX_PRE_BANNER_LINES {
        let mut line = Vec::with_capacity(64);
        let n = (&mut *reader)
            .take(MAX_VERSION_LENGTH as u64)
            .read_until(b'\n', &mut line)
            .await?;

        if n == 0 {
            return Err(Error::ConnectionLost(
                "connection closed during version exchange".into(),
            ));
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }

        let text = String::from_utf8_lossy(&line);
        if text.starts_with("SSH-") {
            let remote = Version::parse(&text)?;
            debug!(version = %remote, "Received identification");
            return Ok(remote);
        }
        trace!(line = %text.trim_end(), "Skipping pre-identification line");
    }

    Err(Error::protocol(format!(
        "No identification line within {} lines",
        MAX_PRE_BANNER_LINES
    )))
}
