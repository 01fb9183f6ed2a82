//! SSH user authentication helpers (RFC 4252).
//!
//! Authentication is a collaborator of the session, not part of it: these
//! helpers drive the `ssh-userauth` service purely through
//! [`Session::request_service`], [`Session::send_request`] and
//! [`Session::next_auth_message`].
//!
//! Supported methods:
//! - "none" - Query which methods the server accepts
//! - "password" - Password authentication
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::auth::{authenticate_none, authenticate_password, AuthStatus};
//! # use kestrel_proto::ssh::session::Session;
//!
//! # async fn example(session: &Session) -> kestrel_proto::ssh::Result<()> {
//! let reply = authenticate_none(session, "alice").await?;
//! if let AuthStatus::Failure { methods, .. } = &reply.status {
//!     println!("server accepts: {}", methods.join(","));
//! }
//!
//! let reply = authenticate_password(session, "alice", "secret").await?;
//! assert!(reply.is_success());
//! # Ok(())
//! # }
//! ```

use crate::ssh::error::{Error, Result};
use crate::ssh::message::{Message, UserauthMethodMessage, UserauthRequest};
use crate::ssh::session::Session;
use crate::ssh::wire::{self, Reader};
use bytes::BytesMut;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Service that carries user authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (RFC 4252 Section 8).
const MSG_USERAUTH_PASSWD_CHANGEREQ: u8 = 60;

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; used to list the methods that can continue.
    None,
    /// Password authentication. The password is wiped on drop.
    Password(Zeroizing<String>),
}

impl AuthMethod {
    /// Creates a password method.
    pub fn password(password: &str) -> Self {
        AuthMethod::Password(Zeroizing::new(password.to_string()))
    }

    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
        }
    }

    /// Builds the USERAUTH_REQUEST for `user` and `service`.
    ///
    /// Method-specific fields (RFC 4252 Section 8):
    /// ```text
    /// boolean   FALSE (not changing the password)
    /// string    plaintext password
    /// ```
    pub fn to_request(&self, user: &str, service: &str) -> UserauthRequest {
        let mut method_data = BytesMut::new();
        if let AuthMethod::Password(password) = self {
            wire::put_bool(&mut method_data, false);
            wire::put_string(&mut method_data, password.as_bytes());
        }
        UserauthRequest {
            user: user.to_string(),
            service: service.to_string(),
            method: self.name().to_string(),
            method_data: method_data.to_vec(),
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Final answer to one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// USERAUTH_SUCCESS
    Success,
    /// USERAUTH_FAILURE
    Failure {
        /// Methods that can continue
        methods: Vec<String>,
        /// Whether the attempt succeeded as one step of several
        partial_success: bool,
    },
    /// The server wants the password changed before it accepts it.
    PasswordChangeRequired {
        /// Prompt supplied by the server
        prompt: String,
    },
}

/// Result of an authentication attempt, with any banners shown before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    /// Outcome of the attempt
    pub status: AuthStatus,
    /// USERAUTH_BANNER texts, in arrival order
    pub banners: Vec<String>,
}

impl AuthReply {
    /// Whether the server accepted the attempt.
    pub fn is_success(&self) -> bool {
        self.status == AuthStatus::Success
    }
}

/// Sends one USERAUTH_REQUEST and waits for its final answer.
///
/// Requests the `ssh-userauth` service first if the session has not done
/// so already.
///
/// # Errors
///
/// - [`Error::ProtocolViolation`] for an unexpected authentication message
/// - [`Error::OperationTimedOut`] if the server does not answer in time
/// - [`Error::ConnectionLost`] if the session ends meanwhile
pub async fn authenticate(session: &Session, user: &str, method: &AuthMethod) -> Result<AuthReply> {
    if !session.has_service(USERAUTH_SERVICE) {
        session.request_service(USERAUTH_SERVICE).await?;
    }

    let request = method.to_request(user, CONNECTION_SERVICE);
    session
        .send_request(Message::UserauthRequest(request))
        .await?;
    debug!(user, method = method.name(), "Sent authentication request");

    let mut banners = Vec::new();
    loop {
        let status = match session.next_auth_message().await? {
            Message::UserauthBanner(banner) => {
                banners.push(banner.message);
                continue;
            }
            Message::UserauthSuccess => {
                info!(user, method = method.name(), "Authenticated");
                AuthStatus::Success
            }
            Message::UserauthFailure(failure) => {
                debug!(
                    methods = %failure.methods.join(","),
                    partial_success = failure.partial_success,
                    "Authentication failed"
                );
                AuthStatus::Failure {
                    methods: failure.methods,
                    partial_success: failure.partial_success,
                }
            }
            Message::UserauthMethod(msg) => method_reply(method, &msg)?,
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} during authentication",
                    other.name()
                )))
            }
        };
        return Ok(AuthReply { status, banners });
    }
}

/// Interprets a method-specific reply (numbers 60-79) for `method`.
fn method_reply(method: &AuthMethod, msg: &UserauthMethodMessage) -> Result<AuthStatus> {
    match (method, msg.code) {
        (AuthMethod::Password(_), MSG_USERAUTH_PASSWD_CHANGEREQ) => {
            let mut reader = Reader::new(&msg.body);
            let prompt = reader.read_utf8()?;
            let _language = reader.read_utf8()?;
            warn!("Server requested a password change");
            Ok(AuthStatus::PasswordChangeRequired { prompt })
        }
        _ => Err(Error::protocol(format!(
            "authentication message {} is not valid for method '{}'",
            msg.code,
            method.name()
        ))),
    }
}

/// Tries the "none" method, mostly to learn which methods can continue.
pub async fn authenticate_none(session: &Session, user: &str) -> Result<AuthReply> {
    authenticate(session, user, &AuthMethod::None).await
}

/// Authenticates `user` with a password.
pub async fn authenticate_password(session: &Session, user: &str, password: &str) -> Result<AuthReply> {
    authenticate(session, user, &AuthMethod::password(password)).await
}
