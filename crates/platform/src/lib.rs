//! # Kestrel Platform
//!
//! Error types shared by the Kestrel crates.
//!
//! Protocol crates keep their own fine-grained error enums and convert into
//! [`KestrelError`] at the application boundary, so binaries and demos can
//! use a single `?`-friendly result type.
//!
//! # Examples
//!
//! ```
//! use kestrel_platform::{KestrelError, KestrelResult};
//!
//! fn parse_port(s: &str) -> KestrelResult<u16> {
//!     s.parse()
//!         .map_err(|_| KestrelError::Config(format!("invalid port: {}", s)))
//! }
//!
//! # fn main() -> KestrelResult<()> {
//! assert_eq!(parse_port("22")?, 22);
//! assert!(parse_port("ssh").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{KestrelError, KestrelResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
