//! Protocol implementations for the Kestrel SSH client.
//!
//! This crate provides an asynchronous SSH2 client transport:
//!
//! - **Binary packet codec** - framing, padding, encryption, MAC and AEAD
//! - **Key exchange** - curve25519, fixed-group and group-exchange
//!   Diffie-Hellman, host key verification, rekeying
//! - **Session** - version exchange, state machine and dispatch loop over any
//!   `AsyncRead + AsyncWrite` stream
//! - **Channels** - multiplexed, flow-controlled channels with requests
//!
//! # Features
//!
//! - `ssh` (default) - SSH client transport
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::auth::authenticate_password;
//! use kestrel_proto::ssh::{Session, SessionConfig};
//!
//! # async fn example() -> kestrel_proto::ssh::Result<()> {
//! let session = Session::connect_tcp("example.com:22", SessionConfig::default()).await?;
//! authenticate_password(&session, "user", "password").await?;
//!
//! let output = session.execute("echo hello").await?;
//! assert_eq!(output.stdout, b"hello\n");
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Constant-time MAC verification
//! - Secure memory handling with `zeroize`
//! - Fuzz targets for packet and message decoding
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
