//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The exact bytes of both lines (without CR LF) feed the exchange hash, so a
//! parsed [`Version`] keeps the line it was parsed from.
//!
//! # Security
//!
//! - Maximum line length: 255 characters
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//! - A server may send other lines before its identification; at most
//!   [`MAX_PREAMBLE_LINES`] are skipped
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::version::Version;
//!
//! let version = Version::new("SSHPiper", None);
//! assert_eq!(version.to_string(), "SSH-2.0-SSHPiper");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! assert_eq!(parsed.comments(), Some("Ubuntu-3"));
//! ```

use piper_platform::{PiperError, PiperResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines tolerated before the server's
/// identification string.
pub const MAX_PREAMBLE_LINES: usize = 32;

/// Default identification presented by the proxy on both sides.
pub const DEFAULT_IDENTIFICATION: &str = "SSH-2.0-SSHPiper";

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Full identification line without CR LF
    raw: String,
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "OpenSSH_9.6")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a protocol 2.0 version string.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let raw = match comments {
            Some(c) => format!("SSH-2.0-{} {}", software, c),
            None => format!("SSH-2.0-{}", software),
        };
        Self {
            raw,
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`PiperError::Handshake`] if the line is too long, contains a
    /// null byte, does not start with `SSH-`, or announces a protocol version
    /// other than `2.0` / `1.99`.
    pub fn parse(line: &str) -> PiperResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(PiperError::Handshake(format!(
                "version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(PiperError::Handshake(
                "version string contains null byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            PiperError::Handshake(format!("invalid version string: '{}'", line))
        })?;

        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            PiperError::Handshake(format!("invalid version string format: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(PiperError::Handshake(format!(
                "unsupported protocol version '{}'",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            raw: line.to_string(),
            proto_version: proto_version.to_string(),
            software_version,
            comments,
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

    /// The identification line as it enters the exchange hash.
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.raw).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Writes our identification line.
pub async fn write_identification<W>(writer: &mut W, version: &Version) -> PiperResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&version.to_wire_format()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the peer's identification line.
///
/// With `allow_preamble` (client role) up to [`MAX_PREAMBLE_LINES`] lines not
/// starting with `SSH-` are skipped, as RFC 4253 permits servers to send them.
pub async fn read_identification<R>(reader: &mut R, allow_preamble: bool) -> PiperResult<Version>
where
    R: AsyncBufRead + Unpin,
{
    for _ in 0..=MAX_PREAMBLE_LINES {
        let line = read_line(reader).await?;
        if line.starts_with("SSH-") {
            return Version::parse(&line);
        }
        if !allow_preamble {
            return Err(PiperError::Handshake(format!(
                "expected identification string, got '{}'",
                line.escape_debug()
            )));
        }
    }
    Err(PiperError::Handshake(
        "too many lines before identification string".to_string(),
    ))
}

async fn read_line<R>(reader: &mut R) -> PiperResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(PiperError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during version exchange",
            )));
        }

        let newline = available.iter().position(|&b| b == b'\n');
        let take = newline.map_or(available.len(), |pos| pos + 1);
        line.extend_from_slice(&available[..take]);
        reader.consume(take);

        if line.len() > MAX_VERSION_LENGTH + 2 {
            return Err(PiperError::Handshake(format!(
                "identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
        if newline.is_some() {
            break;
        }
    }

    let text = String::from_utf8(line)
        .map_err(|_| PiperError::Handshake("identification is not UTF-8".to_string()))?;
    Ok(text
        .trim_end_matches('\n')
        .trim_end_matches('\r')
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_version_new() {
        let version = Version::new("SSHPiper", Some("proxy"));
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "SSHPiper");
        assert_eq!(version.comments(), Some("proxy"));
        assert_eq!(version.to_string(), "SSH-2.0-SSHPiper proxy");
        assert_eq!(version.to_wire_format(), b"SSH-2.0-SSHPiper proxy\r\n");
    }

    #[test]
    fn test_parse_keeps_raw_line() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13\r\n").unwrap();
        assert_eq!(version.as_bytes(), b"SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_parse_1_99() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-1.5-Old").is_err());
        assert!(Version::parse("SSH-2.0").is_err());
        assert!(Version::parse("SSH-2.0-Bad\0Name").is_err());
        let long = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(matches!(
            Version::parse(&long),
            Err(PiperError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_read_identification_skips_preamble() {
        let input: &[u8] = b"Welcome\r\nto the host\r\nSSH-2.0-OpenSSH_9.6\r\nrest";
        let mut reader = BufReader::new(input);
        let version = read_identification(&mut reader, true).await.unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");

        let mut remaining = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut remaining)
            .await
            .unwrap();
        assert_eq!(remaining, b"rest");
    }

    #[tokio::test]
    async fn test_read_identification_server_rejects_preamble() {
        let input: &[u8] = b"hello\r\nSSH-2.0-OpenSSH_9.6\r\n";
        let mut reader = BufReader::new(input);
        assert!(read_identification(&mut reader, false).await.is_err());
    }

    #[tokio::test]
    async fn test_read_identification_eof() {
        let input: &[u8] = b"SSH-2.0-trunc";
        let mut reader = BufReader::new(input);
        let err = read_identification(&mut reader, false).await.unwrap_err();
        assert!(err.is_eof());
    }
}
