//! OpenSSH authorized_keys parsing for downstream publickey checks.
//!
//! # Format
//!
//! ```text
//! [options] keytype base64-key [comment]
//! ```
//!
//! Options are comma separated and may contain double-quoted values with
//! spaces. Keys carrying the `cert-authority` option are user CA keys rather
//! than user keys.
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::authorized_keys::AuthorizedKeys;
//!
//! let keys = AuthorizedKeys::parse("# nobody yet\n");
//! assert!(keys.keys().is_empty());
//! ```

use base64::Engine;
use piper_platform::{PiperError, PiperResult};
use tracing::warn;

/// A single authorized key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    options: Vec<String>,
    algorithm: String,
    key_data: Vec<u8>,
    comment: String,
}

impl AuthorizedKey {
    /// Returns the options.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Returns the key type.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks for a flag option such as `cert-authority`, or the name of a
    /// `name="value"` option.
    pub fn has_option(&self, option: &str) -> bool {
        self.options
            .iter()
            .any(|opt| {
                opt == option || opt.split_once('=').map_or(false, |(name, _)| name == option)
            })
    }

    /// Parses one non-empty, non-comment line.
    pub fn parse_line(line: &str) -> PiperResult<Self> {
        let line = line.trim();
        let (options, rest) = if is_key_type(first_token(line)) {
            (Vec::new(), line)
        } else {
            let (options, rest) = split_options(line)?;
            (options, rest.trim_start())
        };

        let mut parts = rest.splitn(3, char::is_whitespace);
        let algorithm = parts.next().filter(|a| is_key_type(a)).ok_or_else(|| {
            PiperError::Config("no key type found in authorized_keys line".to_string())
        })?;
        let encoded = parts.next().ok_or_else(|| {
            PiperError::Config("missing key data in authorized_keys line".to_string())
        })?;

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| PiperError::Config(format!("invalid base64 key data: {}", e)))?;

        Ok(Self {
            options,
            algorithm: algorithm.to_string(),
            key_data,
            comment: parts.next().unwrap_or_default().trim().to_string(),
        })
    }
}

fn first_token(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or_default()
}

/// Splits the leading option list, honouring double quotes.
fn split_options(line: &str) -> PiperResult<(Vec<String>, &str)> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for (idx, c) in line.char_indices() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => options.push(std::mem::take(&mut current)),
            c if c.is_whitespace() && !quoted => {
                options.push(current);
                return Ok((options, &line[idx..]));
            }
            _ => current.push(c),
        }
    }
    Err(PiperError::Config(
        "authorized_keys line has options but no key".to_string(),
    ))
}

fn is_key_type(s: &str) -> bool {
    matches!(
        s,
        "ssh-rsa"
            | "ssh-ed25519"
            | "ecdsa-sha2-nistp256"
            | "ecdsa-sha2-nistp384"
            | "ecdsa-sha2-nistp521"
    )
}

/// Parsed authorized_keys content.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeys {
    /// Parses authorized_keys content. Unparseable lines are logged and
    /// skipped, as sshd does.
    pub fn parse(content: &str) -> Self {
        let keys = content
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with('#')
            })
            .filter_map(|(number, line)| match AuthorizedKey::parse_line(line) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(line = number + 1, error = %e, "skipping authorized_keys line");
                    None
                }
            })
            .collect();
        Self { keys }
    }

    /// Loads and parses a file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> PiperResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PiperError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    /// Returns all entries.
    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Whether `blob` is listed as a user key.
    pub fn contains(&self, blob: &[u8]) -> bool {
        self.keys
            .iter()
            .any(|key| !key.has_option("cert-authority") && key.key_data() == blob)
    }

    /// Blobs of the keys marked `cert-authority`.
    pub fn cert_authorities(&self) -> Vec<Vec<u8>> {
        self.keys
            .iter()
            .filter(|key| key.has_option("cert-authority"))
            .map(|key| key.key_data().to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::privatekey::PrivateKey;

    fn encoded() -> (Vec<u8>, String) {
        let blob = PrivateKey::generate_ed25519().public_key().to_blob();
        let text = base64::engine::general_purpose::STANDARD.encode(&blob);
        (blob, text)
    }

    #[test]
    fn test_parse_simple_key() {
        let (blob, text) = encoded();
        let key = AuthorizedKey::parse_line(&format!("ssh-ed25519 {} user@host", text)).unwrap();
        assert_eq!(key.algorithm(), "ssh-ed25519");
        assert_eq!(key.key_data(), &blob[..]);
        assert_eq!(key.comment(), "user@host");
        assert!(key.options().is_empty());
    }

    #[test]
    fn test_parse_quoted_options() {
        let (_, text) = encoded();
        let line = format!(
            "command=\"echo hello world\",no-pty,from=\"10.0.0.0/8\" ssh-ed25519 {}",
            text
        );
        let key = AuthorizedKey::parse_line(&line).unwrap();
        assert_eq!(key.options().len(), 3);
        assert_eq!(key.options()[0], "command=\"echo hello world\"");
        assert!(key.has_option("no-pty"));
        assert!(key.has_option("from"));
        assert_eq!(key.comment(), "");
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let (blob, text) = encoded();
        let content = format!("# comment\n\nssh-ed25519\nno-pty\nssh-ed25519 {}\n", text);
        let keys = AuthorizedKeys::parse(&content);
        assert_eq!(keys.keys().len(), 1);
        assert!(keys.contains(&blob));
        assert!(!keys.contains(b"other"));
    }

    #[test]
    fn test_cert_authority_entries() {
        let (user, user_text) = encoded();
        let (ca, ca_text) = encoded();
        let content = format!(
            "ssh-ed25519 {}\ncert-authority,principals=\"alice\" ssh-ed25519 {}\n",
            user_text, ca_text
        );
        let keys = AuthorizedKeys::parse(&content);
        assert!(keys.contains(&user));
        assert!(!keys.contains(&ca));
        assert_eq!(keys.cert_authorities(), vec![ca]);
    }
}
