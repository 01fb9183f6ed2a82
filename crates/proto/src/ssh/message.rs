//! SSH protocol messages (RFC 4253 Section 12, RFC 4252, RFC 4254).
//!
//! [`Message`] is a closed enum over every message the client understands.
//! Decoding is a single exhaustive match on the leading type byte; bytes with
//! no decoder fail with [`Error::UnsupportedMessage`].
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! Numbers 30-49 and 60-79 are reused by different key exchange and
//! authentication methods, so they decode to raw envelopes
//! ([`KexMethodMessage`], [`UserauthMethodMessage`]) that the active method
//! interprets.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::message::{Message, MessageType};
//!
//! let msg = Message::Ignore(b"keepalive".to_vec());
//! let payload = msg.encode();
//! assert_eq!(payload[0], MessageType::Ignore as u8);
//! assert_eq!(Message::decode(&payload).unwrap(), msg);
//! ```

use crate::ssh::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust,
};
use crate::ssh::error::{Error, Result};
use crate::ssh::kex::KexInit;
use crate::ssh::wire::{self, Reader};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// SSH message type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// DH/ECDH init; also KEX_DH_GEX_REQUEST_OLD.
    KexdhInit = 30,
    /// DH/ECDH reply; also KEX_DH_GEX_GROUP.
    KexdhReply = 31,
    /// Group exchange init (RFC 4419).
    KexDhGexInit = 32,
    /// Group exchange reply (RFC 4419).
    KexDhGexReply = 33,
    /// Group exchange request (RFC 4419).
    KexDhGexRequest = 34,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// First method-specific number (PK_OK, PASSWD_CHANGEREQ, INFO_REQUEST).
    UserauthPkOk = 60,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use kestrel_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        Some(match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexdhInit,
            31 => KexdhReply,
            32 => KexDhGexInit,
            33 => KexDhGexReply,
            34 => KexDhGexRequest,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPkOk,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        })
    }

    /// Returns the RFC name of this message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed,
    /// SSH_DISCONNECT_RESERVED
    Reserved,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName,
    /// Code outside the RFC registry
    Other(u32),
}

impl DisconnectReason {
    /// Numeric reason code.
    pub fn code(&self) -> u32 {
        match self {
            DisconnectReason::HostNotAllowedToConnect => 1,
            DisconnectReason::ProtocolError => 2,
            DisconnectReason::KeyExchangeFailed => 3,
            DisconnectReason::Reserved => 4,
            DisconnectReason::MacError => 5,
            DisconnectReason::CompressionError => 6,
            DisconnectReason::ServiceNotAvailable => 7,
            DisconnectReason::ProtocolVersionNotSupported => 8,
            DisconnectReason::HostKeyNotVerifiable => 9,
            DisconnectReason::ConnectionLost => 10,
            DisconnectReason::ByApplication => 11,
            DisconnectReason::TooManyConnections => 12,
            DisconnectReason::AuthCancelledByUser => 13,
            DisconnectReason::NoMoreAuthMethodsAvailable => 14,
            DisconnectReason::IllegalUserName => 15,
            DisconnectReason::Other(code) => *code,
        }
    }

    /// Maps a numeric code back to a reason.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => DisconnectReason::HostNotAllowedToConnect,
            2 => DisconnectReason::ProtocolError,
            3 => DisconnectReason::KeyExchangeFailed,
            4 => DisconnectReason::Reserved,
            5 => DisconnectReason::MacError,
            6 => DisconnectReason::CompressionError,
            7 => DisconnectReason::ServiceNotAvailable,
            8 => DisconnectReason::ProtocolVersionNotSupported,
            9 => DisconnectReason::HostKeyNotVerifiable,
            10 => DisconnectReason::ConnectionLost,
            11 => DisconnectReason::ByApplication,
            12 => DisconnectReason::TooManyConnections,
            13 => DisconnectReason::AuthCancelledByUser,
            14 => DisconnectReason::NoMoreAuthMethodsAvailable,
            15 => DisconnectReason::IllegalUserName,
            other => DisconnectReason::Other(other),
        }
    }
}

/// SSH_MSG_DISCONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason: DisconnectReason,
    /// Human-readable description
    pub description: String,
    /// Language tag (usually empty)
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect message with an empty language tag.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
            language: String::new(),
        }
    }
}

/// SSH_MSG_DEBUG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the client should display the message
    pub always_display: bool,
    /// Message text
    pub message: String,
    /// Language tag
    pub language: String,
}

/// Key exchange method message (numbers 30-49).
///
/// The body is interpreted by the active key exchange method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexMethodMessage {
    /// Message number
    pub code: u8,
    /// Everything after the message number
    pub body: Vec<u8>,
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
///
/// The method-specific fields are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthRequest {
    /// User name
    pub user: String,
    /// Service to start after authentication
    pub service: String,
    /// Method name ("password", "publickey", "none", ...)
    pub method: String,
    /// Method-specific fields, already encoded
    pub method_data: Vec<u8>,
}

/// SSH_MSG_USERAUTH_FAILURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthFailure {
    /// Methods that can continue
    pub methods: Vec<String>,
    /// Whether the last request succeeded partially
    pub partial_success: bool,
}

/// SSH_MSG_USERAUTH_BANNER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthBanner {
    /// Banner text
    pub message: String,
    /// Language tag
    pub language: String,
}

/// Authentication method message (numbers 60-79).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthMethodMessage {
    /// Message number
    pub code: u8,
    /// Everything after the message number
    pub body: Vec<u8>,
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether a reply is expected
    pub want_reply: bool,
    /// Request-specific data, already encoded
    pub data: Vec<u8>,
}

/// Every message understood by the transport, authentication and
/// connection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// SSH_MSG_DISCONNECT
    Disconnect(Disconnect),
    /// SSH_MSG_IGNORE
    Ignore(Vec<u8>),
    /// SSH_MSG_UNIMPLEMENTED carrying the rejected sequence number
    Unimplemented(u32),
    /// SSH_MSG_DEBUG
    Debug(DebugMessage),
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest(String),
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept(String),
    /// SSH_MSG_KEXINIT
    KexInit(Box<KexInit>),
    /// SSH_MSG_NEWKEYS
    NewKeys,
    /// Key exchange method message (30-49)
    KexMethod(KexMethodMessage),
    /// SSH_MSG_USERAUTH_REQUEST
    UserauthRequest(UserauthRequest),
    /// SSH_MSG_USERAUTH_FAILURE
    UserauthFailure(UserauthFailure),
    /// SSH_MSG_USERAUTH_SUCCESS
    UserauthSuccess,
    /// SSH_MSG_USERAUTH_BANNER
    UserauthBanner(UserauthBanner),
    /// Authentication method message (60-79)
    UserauthMethod(UserauthMethodMessage),
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest(GlobalRequest),
    /// SSH_MSG_REQUEST_SUCCESS with request-specific data
    RequestSuccess(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation(ChannelOpenConfirmation),
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure(ChannelOpenFailure),
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    ChannelWindowAdjust(ChannelWindowAdjust),
    /// SSH_MSG_CHANNEL_DATA
    ChannelData(ChannelData),
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ChannelExtendedData(ChannelExtendedData),
    /// SSH_MSG_CHANNEL_EOF
    ChannelEof(ChannelEof),
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose(ChannelClose),
    /// SSH_MSG_CHANNEL_REQUEST
    ChannelRequest(ChannelRequest),
    /// SSH_MSG_CHANNEL_SUCCESS
    ChannelSuccess(ChannelSuccess),
    /// SSH_MSG_CHANNEL_FAILURE
    ChannelFailure(ChannelFailure),
}

impl Message {
    /// Leading type byte of this message.
    pub fn code(&self) -> u8 {
        match self {
            Message::Disconnect(_) => MessageType::Disconnect as u8,
            Message::Ignore(_) => MessageType::Ignore as u8,
            Message::Unimplemented(_) => MessageType::Unimplemented as u8,
            Message::Debug(_) => MessageType::Debug as u8,
            Message::ServiceRequest(_) => MessageType::ServiceRequest as u8,
            Message::ServiceAccept(_) => MessageType::ServiceAccept as u8,
            Message::KexInit(_) => MessageType::KexInit as u8,
            Message::NewKeys => MessageType::NewKeys as u8,
            Message::KexMethod(m) => m.code,
            Message::UserauthRequest(_) => MessageType::UserauthRequest as u8,
            Message::UserauthFailure(_) => MessageType::UserauthFailure as u8,
            Message::UserauthSuccess => MessageType::UserauthSuccess as u8,
            Message::UserauthBanner(_) => MessageType::UserauthBanner as u8,
            Message::UserauthMethod(m) => m.code,
            Message::GlobalRequest(_) => MessageType::GlobalRequest as u8,
            Message::RequestSuccess(_) => MessageType::RequestSuccess as u8,
            Message::RequestFailure => MessageType::RequestFailure as u8,
            Message::ChannelOpen(_) => MessageType::ChannelOpen as u8,
            Message::ChannelOpenConfirmation(_) => MessageType::ChannelOpenConfirmation as u8,
            Message::ChannelOpenFailure(_) => MessageType::ChannelOpenFailure as u8,
            Message::ChannelWindowAdjust(_) => MessageType::ChannelWindowAdjust as u8,
            Message::ChannelData(_) => MessageType::ChannelData as u8,
            Message::ChannelExtendedData(_) => MessageType::ChannelExtendedData as u8,
            Message::ChannelEof(_) => MessageType::ChannelEof as u8,
            Message::ChannelClose(_) => MessageType::ChannelClose as u8,
            Message::ChannelRequest(_) => MessageType::ChannelRequest as u8,
            Message::ChannelSuccess(_) => MessageType::ChannelSuccess as u8,
            Message::ChannelFailure(_) => MessageType::ChannelFailure as u8,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match MessageType::from_u8(self.code()) {
            Some(t) => t.name(),
            None if (30..=49).contains(&self.code()) => "SSH_MSG_KEX_METHOD",
            None => "SSH_MSG_USERAUTH_METHOD",
        }
    }

    /// Transport-generic messages are allowed at any time, including in the
    /// middle of a key exchange.
    pub fn is_transport_generic(&self) -> bool {
        matches!(
            self,
            Message::Disconnect(_)
                | Message::Ignore(_)
                | Message::Unimplemented(_)
                | Message::Debug(_)
        )
    }

    /// Messages that belong to the key exchange itself.
    pub fn is_kex(&self) -> bool {
        matches!(
            self,
            Message::KexInit(_) | Message::NewKeys | Message::KexMethod(_)
        )
    }

    /// Recipient channel for channel-scoped messages.
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            Message::ChannelOpenConfirmation(m) => Some(m.recipient_channel),
            Message::ChannelOpenFailure(m) => Some(m.recipient_channel),
            Message::ChannelWindowAdjust(m) => Some(m.recipient_channel),
            Message::ChannelData(m) => Some(m.recipient_channel),
            Message::ChannelExtendedData(m) => Some(m.recipient_channel),
            Message::ChannelEof(m) => Some(m.recipient_channel),
            Message::ChannelClose(m) => Some(m.recipient_channel),
            Message::ChannelRequest(m) => Some(m.recipient_channel),
            Message::ChannelSuccess(m) => Some(m.recipient_channel),
            Message::ChannelFailure(m) => Some(m.recipient_channel),
            _ => None,
        }
    }

    /// Serializes this message to a packet payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.code());
        match self {
            Message::Disconnect(m) => {
                buf.put_u32(m.reason.code());
                wire::put_string(&mut buf, m.description.as_bytes());
                wire::put_string(&mut buf, m.language.as_bytes());
            }
            Message::Ignore(data) => wire::put_string(&mut buf, data),
            Message::Unimplemented(seq) => buf.put_u32(*seq),
            Message::Debug(m) => {
                wire::put_bool(&mut buf, m.always_display);
                wire::put_string(&mut buf, m.message.as_bytes());
                wire::put_string(&mut buf, m.language.as_bytes());
            }
            Message::ServiceRequest(name) | Message::ServiceAccept(name) => {
                wire::put_string(&mut buf, name.as_bytes())
            }
            Message::KexInit(m) => return m.to_bytes(),
            Message::NewKeys | Message::UserauthSuccess | Message::RequestFailure => {}
            Message::KexMethod(m) => buf.put_slice(&m.body),
            Message::UserauthRequest(m) => {
                wire::put_string(&mut buf, m.user.as_bytes());
                wire::put_string(&mut buf, m.service.as_bytes());
                wire::put_string(&mut buf, m.method.as_bytes());
                buf.put_slice(&m.method_data);
            }
            Message::UserauthFailure(m) => {
                wire::put_name_list(&mut buf, &m.methods);
                wire::put_bool(&mut buf, m.partial_success);
            }
            Message::UserauthBanner(m) => {
                wire::put_string(&mut buf, m.message.as_bytes());
                wire::put_string(&mut buf, m.language.as_bytes());
            }
            Message::UserauthMethod(m) => buf.put_slice(&m.body),
            Message::GlobalRequest(m) => {
                wire::put_string(&mut buf, m.name.as_bytes());
                wire::put_bool(&mut buf, m.want_reply);
                buf.put_slice(&m.data);
            }
            Message::RequestSuccess(data) => buf.put_slice(data),
            Message::ChannelOpen(m) => return m.to_bytes(),
            Message::ChannelOpenConfirmation(m) => return m.to_bytes(),
            Message::ChannelOpenFailure(m) => return m.to_bytes(),
            Message::ChannelWindowAdjust(m) => return m.to_bytes(),
            Message::ChannelData(m) => return m.to_bytes(),
            Message::ChannelExtendedData(m) => return m.to_bytes(),
            Message::ChannelEof(m) => return m.to_bytes(),
            Message::ChannelClose(m) => return m.to_bytes(),
            Message::ChannelRequest(m) => return m.to_bytes(),
            Message::ChannelSuccess(m) => return m.to_bytes(),
            Message::ChannelFailure(m) => return m.to_bytes(),
        }
        buf.to_vec()
    }

    /// Parses a packet payload.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedMessage`] for a type byte with no decoder
    /// - [`Error::ProtocolViolation`] for an empty payload or malformed fields
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let code = *payload
            .first()
            .ok_or_else(|| Error::protocol("empty packet payload"))?;
        let mut r = Reader::new(&payload[1..]);

        let msg = match code {
            1 => {
                let reason = DisconnectReason::from_code(r.read_u32()?);
                // Badly encoded text must not hide the peer's reason code
                let description = String::from_utf8_lossy(r.read_string()?).into_owned();
                // Some peers omit the language tag
                let language = if r.is_empty() {
                    String::new()
                } else {
                    String::from_utf8_lossy(r.read_string()?).into_owned()
                };
                Message::Disconnect(Disconnect {
                    reason,
                    description,
                    language,
                })
            }
            2 => Message::Ignore(r.read_string()?.to_vec()),
            3 => Message::Unimplemented(r.read_u32()?),
            4 => Message::Debug(DebugMessage {
                always_display: r.read_bool()?,
                message: r.read_utf8()?,
                language: if r.is_empty() {
                    String::new()
                } else {
                    r.read_utf8()?
                },
            }),
            5 => Message::ServiceRequest(r.read_utf8()?),
            6 => Message::ServiceAccept(r.read_utf8()?),
            20 => return Ok(Message::KexInit(Box::new(KexInit::from_bytes(payload)?))),
            21 => Message::NewKeys,
            30..=49 => Message::KexMethod(KexMethodMessage {
                code,
                body: r.rest().to_vec(),
            }),
            50 => Message::UserauthRequest(UserauthRequest {
                user: r.read_utf8()?,
                service: r.read_utf8()?,
                method: r.read_utf8()?,
                method_data: r.rest().to_vec(),
            }),
            51 => Message::UserauthFailure(UserauthFailure {
                methods: r.read_name_list()?,
                partial_success: r.read_bool()?,
            }),
            52 => Message::UserauthSuccess,
            53 => Message::UserauthBanner(UserauthBanner {
                message: r.read_utf8()?,
                language: if r.is_empty() {
                    String::new()
                } else {
                    r.read_utf8()?
                },
            }),
            60..=79 => Message::UserauthMethod(UserauthMethodMessage {
                code,
                body: r.rest().to_vec(),
            }),
            80 => Message::GlobalRequest(GlobalRequest {
                name: r.read_utf8()?,
                want_reply: r.read_bool()?,
                data: r.rest().to_vec(),
            }),
            81 => Message::RequestSuccess(r.rest().to_vec()),
            82 => Message::RequestFailure,
            90 => return Ok(Message::ChannelOpen(ChannelOpen::from_bytes(payload)?)),
            91 => {
                return Ok(Message::ChannelOpenConfirmation(
                    ChannelOpenConfirmation::from_bytes(payload)?,
                ))
            }
            92 => {
                return Ok(Message::ChannelOpenFailure(ChannelOpenFailure::from_bytes(
                    payload,
                )?))
            }
            93 => {
                return Ok(Message::ChannelWindowAdjust(
                    ChannelWindowAdjust::from_bytes(payload)?,
                ))
            }
            94 => return Ok(Message::ChannelData(ChannelData::from_bytes(payload)?)),
            95 => {
                return Ok(Message::ChannelExtendedData(
                    ChannelExtendedData::from_bytes(payload)?,
                ))
            }
            96 => return Ok(Message::ChannelEof(ChannelEof::from_bytes(payload)?)),
            97 => return Ok(Message::ChannelClose(ChannelClose::from_bytes(payload)?)),
            98 => return Ok(Message::ChannelRequest(ChannelRequest::from_bytes(payload)?)),
            99 => return Ok(Message::ChannelSuccess(ChannelSuccess::from_bytes(payload)?)),
            100 => return Ok(Message::ChannelFailure(ChannelFailure::from_bytes(payload)?)),
            other => return Err(Error::UnsupportedMessage(other)),
        };

        // Envelopes and trailing opaque data consume the rest; every other
        // message must be fully consumed.
        if !matches!(
            msg,
            Message::KexMethod(_)
                | Message::UserauthMethod(_)
                | Message::UserauthRequest(_)
                | Message::GlobalRequest(_)
                | Message::RequestSuccess(_)
        ) {
            r.finish(msg.name())?;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(34), Some(MessageType::KexDhGexRequest));
        assert_eq!(MessageType::from_u8(255), None);
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_disconnect_with_invalid_utf8_description() {
        let mut payload = vec![1, 0, 0, 0, 11];
        payload.extend_from_slice(&[0, 0, 0, 4, b'b', b'y', 0xFF, b'e']);
        payload.extend_from_slice(&[0, 0, 0, 0]);

        match Message::decode(&payload).unwrap() {
            Message::Disconnect(d) => {
                assert_eq!(d.reason, DisconnectReason::ByApplication);
                assert_eq!(d.description, "by\u{FFFD}e");
                assert!(d.language.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_codes() {
        for code in 1..=15 {
            assert_eq!(DisconnectReason::from_code(code).code(), code);
        }
        assert_eq!(
            DisconnectReason::from_code(99),
            DisconnectReason::Other(99)
        );
    }

    #[test]
    fn test_transport_messages_round_trip() {
        let messages = vec![
            Message::Disconnect(Disconnect::new(DisconnectReason::ByApplication, "bye")),
            Message::Ignore(vec![1, 2, 3]),
            Message::Unimplemented(7),
            Message::Debug(DebugMessage {
                always_display: true,
                message: "hello".into(),
                language: String::new(),
            }),
            Message::ServiceRequest("ssh-userauth".into()),
            Message::ServiceAccept("ssh-userauth".into()),
            Message::NewKeys,
            Message::KexMethod(KexMethodMessage {
                code: 31,
                body: vec![0, 0, 0, 1, 9],
            }),
            Message::UserauthFailure(UserauthFailure {
                methods: vec!["publickey".into(), "password".into()],
                partial_success: false,
            }),
            Message::UserauthSuccess,
            Message::GlobalRequest(GlobalRequest {
                name: "keepalive@openssh.com".into(),
                want_reply: true,
                data: vec![],
            }),
            Message::RequestSuccess(vec![0, 0, 0x1f, 0x90]),
            Message::RequestFailure,
        ];

        for msg in messages {
            let decoded = Message::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        assert_eq!(Message::decode(&[200, 1, 2]), Err(Error::UnsupportedMessage(200)));
        assert_eq!(Message::decode(&[7]), Err(Error::UnsupportedMessage(7)));
    }

    #[test]
    fn test_empty_payload_is_violation() {
        assert!(matches!(
            Message::decode(&[]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut payload = Message::Unimplemented(3).encode();
        payload.push(0);
        assert!(matches!(
            Message::decode(&payload),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_disconnect_without_language() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u32(11);
        wire::put_string(&mut buf, b"closed");
        match Message::decode(&buf).unwrap() {
            Message::Disconnect(d) => {
                assert_eq!(d.reason, DisconnectReason::ByApplication);
                assert_eq!(d.description, "closed");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classification() {
        assert!(Message::Ignore(vec![]).is_transport_generic());
        assert!(Message::NewKeys.is_kex());
        assert!(!Message::RequestFailure.is_kex());
        assert_eq!(
            Message::ChannelEof(ChannelEof::new(4)).recipient_channel(),
            Some(4)
        );
    }
}
