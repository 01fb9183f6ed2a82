//! SSH (Secure Shell) client transport, RFC 4251-4254.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Encoding** ([`wire`], [`message`]) - SSH data types and the closed
//!    set of messages
//! 2. **Packet Layer** ([`packet`], [`crypto`]) - Binary packet protocol
//!    (RFC 4253 Section 6) with cipher, MAC, ETM and AEAD modes
//! 3. **Key Exchange** ([`kex`], [`kex_dh`], [`hostkey`], [`registry`]) -
//!    Negotiation, DH/ECDH methods, host key verification, key derivation
//! 4. **Session** ([`session`], [`transport`]) - Version exchange, state
//!    machine, rekeying and the dispatch loop
//! 5. **Connection Layer** ([`connection`], [`channel`]) - Channels,
//!    flow control and requests (RFC 4254)
//! 6. **Authentication** ([`auth`]) - Password and "none" helpers built on
//!    the session's request/response primitive (RFC 4252)
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packets are bounded by the configured maximum
//!   (35000 bytes by default) and every field read is bounds checked
//! - **Constant-Time Operations**: MAC tags are compared in constant time
//! - **Memory Safety**: Key material is zeroized on drop using [`zeroize`]
//! - **Host Keys**: The server signature is verified before the acceptance
//!   callback runs, on every key exchange
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::{Session, SessionConfig};
//!
//! # async fn example() -> kestrel_proto::ssh::Result<()> {
//! let config = SessionConfig::builder()
//!     .with_host_key_callback(|info| {
//!         println!("{} {}", info.algorithm, info.fingerprint);
//!         true
//!     })
//!     .build()?;
//! let session = Session::connect_tcp("example.com:22", config).await?;
//! println!("negotiated: {:?}", session.algorithms());
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
mod mux;
pub mod packet;
pub mod registry;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{authenticate_none, authenticate_password, AuthMethod, AuthReply, AuthStatus};
pub use channel::{Channel, ChannelEvent, ChannelState, ReceiveWindow, SendWindow};
pub use config::{SessionConfig, SessionConfigBuilder};
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use error::{Error, Result};
pub use hostkey::{HostKeyCallback, HostKeyInfo};
pub use kex::{negotiate_algorithm, KexInit, NegotiatedAlgorithms};
pub use kex_dh::derive_key;
pub use message::{DisconnectReason, Message, MessageType};
pub use packet::{DirectionalKeys, PacketOpener, PacketSealer};
pub use registry::{AlgorithmRegistry, Preferences};
pub use session::{ExecOutput, GlobalReply, Session};
pub use transport::SessionState;
pub use version::Version;
