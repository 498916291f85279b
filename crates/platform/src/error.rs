//! Error types shared by the piping engine and the daemon

use std::fmt;

/// SSH disconnect reason `protocol_error`.
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
/// SSH disconnect reason `connection_lost`.
pub const DISCONNECT_CONNECTION_LOST: u32 = 10;
/// SSH disconnect reason `by_application`.
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

/// Unified error type for every pipe and daemon operation
#[derive(Debug)]
pub enum PiperError {
    /// I/O error on a socket or file
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Framing, MAC or decryption failure on an established half-transport
    Transport(String),

    /// Version exchange, algorithm negotiation or host key failure
    Handshake(String),

    /// Unexpected or malformed message
    Protocol(String),

    /// Authentication attempt failed (recoverable inside a pipe)
    Auth(String),

    /// Router callback failed (recoverable inside a pipe)
    Routing(String),

    /// Login grace time elapsed
    Timeout(String),

    /// Upstream could not be reached or went away
    Upstream(String),

    /// Peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Reason code sent by the peer
        code: u32,
        /// Human readable description sent by the peer
        description: String,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl PiperError {
    /// Whether the auth phase may continue after this error.
    ///
    /// Only authentication and routing failures are recovered locally; every
    /// other kind ends the pipe.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PiperError::Auth(_) | PiperError::Routing(_))
    }

    /// Disconnect reason code to report to the downstream for a fatal error.
    pub fn disconnect_code(&self) -> u32 {
        match self {
            PiperError::Transport(_) | PiperError::Handshake(_) | PiperError::Protocol(_) => {
                DISCONNECT_PROTOCOL_ERROR
            }
            PiperError::Io(_) | PiperError::Upstream(_) | PiperError::Disconnected { .. } => {
                DISCONNECT_CONNECTION_LOST
            }
            _ => DISCONNECT_BY_APPLICATION,
        }
    }

    /// Whether the error came from the network going away rather than a fault.
    pub fn is_eof(&self) -> bool {
        match self {
            PiperError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            PiperError::Disconnected { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for PiperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PiperError::Io(e) => write!(f, "IO error: {}", e),
            PiperError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PiperError::Transport(msg) => write!(f, "Transport error: {}", msg),
            PiperError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            PiperError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PiperError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PiperError::Routing(msg) => write!(f, "Routing error: {}", msg),
            PiperError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            PiperError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            PiperError::Disconnected { code, description } => {
                write!(f, "Peer disconnected ({}): {}", code, description)
            }
            PiperError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PiperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PiperError::Io(e) => Some(e),
            PiperError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PiperError {
    fn from(err: std::io::Error) -> Self {
        PiperError::Io(err)
    }
}

/// Result type for pipe operations
pub type PiperResult<T> = Result<T, PiperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PiperError::Handshake("no common cipher".to_string());
        assert_eq!(err.to_string(), "Handshake failed: no common cipher");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PiperError = io_err.into();
        assert!(matches!(err, PiperError::Io(_)));
        assert!(!err.is_eof());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(PiperError::Auth("bad signature".into()).is_recoverable());
        assert!(PiperError::Routing("backend down".into()).is_recoverable());
        assert!(!PiperError::Protocol("unexpected".into()).is_recoverable());
        assert!(!PiperError::Timeout("grace".into()).is_recoverable());
    }

    #[test]
    fn test_disconnect_codes() {
        assert_eq!(
            PiperError::Protocol("x".into()).disconnect_code(),
            DISCONNECT_PROTOCOL_ERROR
        );
        assert_eq!(
            PiperError::Upstream("refused".into()).disconnect_code(),
            DISCONNECT_CONNECTION_LOST
        );
        assert_eq!(
            PiperError::Timeout("grace".into()).disconnect_code(),
            DISCONNECT_BY_APPLICATION
        );
    }

    #[test]
    fn test_eof_detection() {
        let eof: PiperError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed").into();
        assert!(eof.is_eof());
    }
}
