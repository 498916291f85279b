//! SSH protocol message types (RFC 4253, RFC 4252).
//!
//! This module defines the message numbers the proxy inspects and the small
//! transport-level messages it builds itself (disconnect, service request,
//! extension info). Everything else crosses the proxy as opaque bytes.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol** (80-127): only global requests are named here
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

use super::wire::{read_u32, read_u8, read_utf8, write_str, write_u32, write_u8};
use piper_platform::{PiperError, PiperResult};

/// SSH message types as defined in RFC 4253 Section 12 and RFC 4252.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,
    /// Extension negotiation (RFC 8308).
    ExtInfo = 7,

    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    /// Diffie-Hellman/ECDH key exchange init (both use the same number).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply.
    KexdhReply = 31,

    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Public key OK. Shares its number with `SSH_MSG_USERAUTH_INFO_REQUEST`;
    /// which one is meant depends on the method last requested.
    UserauthPkOk = 60,
    /// Keyboard-interactive responses.
    UserauthInfoResponse = 61,

    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,

    /// OpenSSH transport ping.
    Ping = 192,
    /// OpenSSH transport pong.
    Pong = 193,
}

/// Number of `SSH_MSG_USERAUTH_INFO_REQUEST` (RFC 4256).
pub const USERAUTH_INFO_REQUEST: u8 = 60;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use piper_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(94), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            7 => Some(MessageType::ExtInfo),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            192 => Some(MessageType::Ping),
            193 => Some(MessageType::Pong),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// ```rust
    /// use piper_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::ExtInfo => "SSH_MSG_EXT_INFO",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::Ping => "SSH_MSG_PING",
            MessageType::Pong => "SSH_MSG_PONG",
        }
    }

    /// Whether the message belongs to key exchange and must never be relayed.
    pub fn is_kex(byte: u8) -> bool {
        (20..=49).contains(&byte)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Human readable name of a message number, for logging.
pub fn message_name(byte: u8) -> String {
    match MessageType::from_u8(byte) {
        Some(t) => t.to_string(),
        None => format!("SSH_MSG_{}", byte),
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum DisconnectReason {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MacError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Maps a wire code back to a reason, defaulting to `ByApplication`.
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
            12 => DisconnectReason::TooManyConnections,
            13 => DisconnectReason::AuthCancelledByUser,
            14 => DisconnectReason::NoMoreAuthMethodsAvailable,
            15 => DisconnectReason::IllegalUserName,
            _ => DisconnectReason::ByApplication,
        }
    }
}

/// SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason: DisconnectReason,
    /// Description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
        }
    }

    /// Serializes the message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.description.len());
        write_u8(&mut buf, MessageType::Disconnect as u8);
        write_u32(&mut buf, self.reason as u32);
        write_str(&mut buf, &self.description);
        write_str(&mut buf, "");
        buf
    }

    /// Parses a disconnect payload.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        if read_u8(data, &mut offset)? != MessageType::Disconnect as u8 {
            return Err(PiperError::Protocol("not a disconnect message".to_string()));
        }
        let code = read_u32(data, &mut offset)?;
        let description = read_utf8(data, &mut offset).unwrap_or_default();
        Ok(Self {
            reason: DisconnectReason::from_code(code),
            description,
        })
    }

    /// Converts a received disconnect into the error that ends the pipe.
    pub fn into_error(self) -> PiperError {
        PiperError::Disconnected {
            code: self.reason as u32,
            description: self.description,
        }
    }
}

/// Builds SSH_MSG_SERVICE_REQUEST or SSH_MSG_SERVICE_ACCEPT.
pub fn service_message(kind: MessageType, service: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + service.len());
    write_u8(&mut buf, kind as u8);
    write_str(&mut buf, service);
    buf
}

/// Parses the service name out of SSH_MSG_SERVICE_REQUEST/ACCEPT.
pub fn parse_service_message(kind: MessageType, data: &[u8]) -> PiperResult<String> {
    let mut offset = 0;
    let got = read_u8(data, &mut offset)?;
    if got != kind as u8 {
        return Err(PiperError::Protocol(format!(
            "expected {}, got {}",
            kind,
            message_name(got)
        )));
    }
    read_utf8(data, &mut offset)
}
