//! SSH connection protocol messages (RFC 4254).
//!
//! Wire types for channel open/confirm/failure, flow control, data, EOF,
//! close and channel requests. The channel state machine that drives them
//! lives in [`crate::ssh::channel`] and [`crate::ssh::mux`].
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 2 * 1024 * 1024, 32768);
//! let bytes = open.to_bytes();
//! assert_eq!(ChannelOpen::from_bytes(&bytes).unwrap(), open);
//! ```

use crate::ssh::error::{Error, Result};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{self, Reader};
use bytes::{BufMut, BytesMut};

/// Largest initial window a client will advertise (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Largest per-channel packet a client will advertise (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

fn expect_type(data: &[u8], expected: MessageType) -> Result<Reader<'_>> {
    match data.first() {
        None => Err(Error::protocol(format!("{} message is empty", expected.name()))),
        Some(&b) if b != expected as u8 => Err(Error::protocol(format!(
            "Invalid message type: expected {}, got {}",
            expected, b
        ))),
        Some(_) => Ok(Reader::new(&data[1..])),
    }
}

/// Channel type with its type-specific open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (shell, exec, subsystem).
    Session,
    /// Client-initiated TCP forwarding.
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Server-initiated forwarding of a remote listener.
    ForwardedTcpip {
        /// Address that was connected
        connected_address: String,
        /// Port that was connected
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// X11 forwarding.
    X11 {
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other type, carried opaquely.
    Other {
        /// Type name
        name: String,
        /// Encoded type-specific data
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::Other { name, .. } => name,
        }
    }

    fn encode_params(&self, buf: &mut BytesMut) {
        match self {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                wire::put_string(buf, host.as_bytes());
                buf.put_u32(*port);
                wire::put_string(buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                wire::put_string(buf, connected_address.as_bytes());
                buf.put_u32(*connected_port);
                wire::put_string(buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelType::X11 {
                originator_address,
                originator_port,
            } => {
                wire::put_string(buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode_params(name: &str, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match name {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.read_utf8()?,
                port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.read_utf8()?,
                connected_port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "x11" => ChannelType::X11 {
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            other => ChannelType::Other {
                name: other.to_string(),
                data: r.rest().to_vec(),
            },
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and parameters
    pub channel_type: ChannelType,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::put_string(&mut buf, self.channel_type.name().as_bytes());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        self.channel_type.encode_params(&mut buf);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelOpen)?;
        let name = r.read_utf8()?;
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;
        let channel_type = ChannelType::decode_params(&name, &mut r)?;
        r.finish("SSH_MSG_CHANNEL_OPEN")?;
        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Peer's initial window
    pub initial_window_size: u32,
    /// Peer's maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes. Channel-type-specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage,
    /// Code outside the RFC registry
    Other(u32),
}

impl ChannelOpenFailureReason {
    /// Maps a numeric code to a reason.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => ChannelOpenFailureReason::AdministrativelyProhibited,
            2 => ChannelOpenFailureReason::ConnectFailed,
            3 => ChannelOpenFailureReason::UnknownChannelType,
            4 => ChannelOpenFailureReason::ResourceShortage,
            other => ChannelOpenFailureReason::Other(other),
        }
    }

    /// Numeric code.
    pub fn code(&self) -> u32 {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => 1,
            ChannelOpenFailureReason::ConnectFailed => 2,
            ChannelOpenFailureReason::UnknownChannelType => 3,
            ChannelOpenFailureReason::ResourceShortage => 4,
            ChannelOpenFailureReason::Other(code) => *code,
        }
    }

    /// Returns a human-readable string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => "administratively prohibited",
            ChannelOpenFailureReason::ConnectFailed => "connect failed",
            ChannelOpenFailureReason::UnknownChannelType => "unknown channel type",
            ChannelOpenFailureReason::ResourceShortage => "resource shortage",
            ChannelOpenFailureReason::Other(_) => "unknown reason",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Our channel number
    pub recipient_channel: u32,
    /// Reason code
    pub reason: ChannelOpenFailureReason,
    /// Description
    pub description: String,
    /// Language tag
    pub language: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason,
            description: reason.as_str().to_string(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason.code());
        wire::put_string(&mut buf, self.description.as_bytes());
        wire::put_string(&mut buf, self.language.as_bytes());
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.read_u32()?;
        let reason = ChannelOpenFailureReason::from_u32(r.read_u32()?);
        let description = r.read_utf8()?;
        let language = if r.is_empty() {
            String::new()
        } else {
            r.read_utf8()?
        };
        r.finish("SSH_MSG_CHANNEL_OPEN_FAILURE")?;
        Ok(Self {
            recipient_channel,
            reason,
            description,
            language,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Bytes to add to the window
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelWindowAdjust)?;
        let msg = Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        };
        r.finish("SSH_MSG_CHANNEL_WINDOW_ADJUST")?;
        Ok(msg)
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data bytes
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelData)?;
        let msg = Self {
            recipient_channel: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        };
        r.finish("SSH_MSG_CHANNEL_DATA")?;
        Ok(msg)
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data type code (1 = stderr)
    pub data_type_code: u32,
    /// Data bytes
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        wire::put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelExtendedData)?;
        let msg = Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        };
        r.finish("SSH_MSG_CHANNEL_EXTENDED_DATA")?;
        Ok(msg)
    }
}

// Messages that carry nothing but the recipient channel.
macro_rules! channel_only_message {
    ($(#[$doc:meta])* $name:ident, $ty:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Recipient channel number
            pub recipient_channel: u32,
        }

        impl $name {
            /// Creates a new message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($ty as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> Result<Self> {
                let mut r = expect_type(data, $ty)?;
                let recipient_channel = r.read_u32()?;
                r.finish($label)?;
                Ok(Self { recipient_channel })
            }
        }
    };
}

channel_only_message!(
    /// SSH_MSG_CHANNEL_EOF (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof,
    "SSH_MSG_CHANNEL_EOF"
);
channel_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose,
    "SSH_MSG_CHANNEL_CLOSE"
);
channel_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS (RFC 4254 Section 5.4).
    ChannelSuccess,
    MessageType::ChannelSuccess,
    "SSH_MSG_CHANNEL_SUCCESS"
);
channel_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE (RFC 4254 Section 5.4).
    ChannelFailure,
    MessageType::ChannelFailure,
    "SSH_MSG_CHANNEL_FAILURE"
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// X11 forwarding request
    X11Req {
        /// Forward only one connection
        single_connection: bool,
        /// X11 authentication protocol
        auth_protocol: String,
        /// X11 authentication cookie
        auth_cookie: String,
        /// X11 screen number
        screen_number: u32,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Start interactive shell
    Shell,
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Local flow control
    XonXoff {
        /// Whether the client may do flow control
        client_can_do: bool,
    },
    /// Deliver a signal (name without "SIG")
    Signal {
        /// Signal name
        name: String,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Any other request, carried opaquely
    Other {
        /// Request name
        name: String,
        /// Encoded request-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::X11Req { .. } => "x11-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::XonXoff { .. } => "xon-xoff",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }

    fn encode_params(&self, buf: &mut BytesMut) {
        match self {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                wire::put_string(buf, term.as_bytes());
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                wire::put_string(buf, modes);
            }
            ChannelRequestType::X11Req {
                single_connection,
                auth_protocol,
                auth_cookie,
                screen_number,
            } => {
                wire::put_bool(buf, *single_connection);
                wire::put_string(buf, auth_protocol.as_bytes());
                wire::put_string(buf, auth_cookie.as_bytes());
                buf.put_u32(*screen_number);
            }
            ChannelRequestType::Env { name, value } => {
                wire::put_string(buf, name.as_bytes());
                wire::put_string(buf, value.as_bytes());
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Exec { command } => wire::put_string(buf, command.as_bytes()),
            ChannelRequestType::Subsystem { name } => wire::put_string(buf, name.as_bytes()),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::XonXoff { client_can_do } => wire::put_bool(buf, *client_can_do),
            ChannelRequestType::Signal { name } => wire::put_string(buf, name.as_bytes()),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                wire::put_string(buf, signal_name.as_bytes());
                wire::put_bool(buf, *core_dumped);
                wire::put_string(buf, error_message.as_bytes());
                wire::put_string(buf, language_tag.as_bytes());
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode_params(name: &str, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match name {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            },
            "x11-req" => ChannelRequestType::X11Req {
                single_connection: r.read_bool()?,
                auth_protocol: r.read_utf8()?,
                auth_cookie: r.read_utf8()?,
                screen_number: r.read_u32()?,
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec {
                command: r.read_utf8()?,
            },
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "xon-xoff" => ChannelRequestType::XonXoff {
                client_can_do: r.read_bool()?,
            },
            "signal" => ChannelRequestType::Signal {
                name: r.read_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_utf8()?,
                core_dumped: r.read_bool()?,
                error_message: r.read_utf8()?,
                language_tag: r.read_utf8()?,
            },
            other => ChannelRequestType::Other {
                name: other.to_string(),
                data: r.rest().to_vec(),
            },
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Request type and parameters
    pub request_type: ChannelRequestType,
    /// Whether CHANNEL_SUCCESS/FAILURE is expected
    pub want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_string(&mut buf, self.request_type.name().as_bytes());
        wire::put_bool(&mut buf, self.want_reply);
        self.request_type.encode_params(&mut buf);
        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// Unknown request names decode to [`ChannelRequestType::Other`] so the
    /// caller can still answer them with CHANNEL_FAILURE.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = expect_type(data, MessageType::ChannelRequest)?;
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        let request_type = ChannelRequestType::decode_params(&name, &mut r)?;
        r.finish("SSH_MSG_CHANNEL_REQUEST")?;
        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}
