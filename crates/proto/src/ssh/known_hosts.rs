//! OpenSSH known_hosts matching for upstream host-key verification.
//!
//! # Format
//!
//! Each line in a known_hosts file has the format:
//! ```text
//! [@revoked] hostnames keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! `@cert-authority` lines are ignored; host certificates are not used
//! toward upstreams.
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::known_hosts::{HostKeyStatus, KnownHosts};
//!
//! let known = KnownHosts::parse("# empty\n").unwrap();
//! assert_eq!(known.verify("example.com", 22, b"blob"), HostKeyStatus::Unknown);
//! ```

use super::hostkey::blob_key_type;
use base64::Engine;
use hmac::{Hmac, Mac};
use piper_platform::{PiperError, PiperResult};
use sha1::Sha1;
use subtle::ConstantTimeEq;

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    /// Hostname pattern list
    hostname_pattern: String,
    /// Key type (e.g., "ssh-ed25519")
    key_type: String,
    /// Public key blob
    key_data: Vec<u8>,
    /// Marked `@revoked`
    revoked: bool,
}

impl KnownHost {
    /// Returns the hostname pattern.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Checks if this entry applies to `hostname` on `port`.
    ///
    /// A matching negated pattern excludes the host regardless of the others.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let full_host = if port == 22 {
            hostname.to_string()
        } else {
            format!("[{}]:{}", hostname, port)
        };

        let mut matched = false;
        for pattern in self.hostname_pattern.split(',') {
            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host) {
                    return false;
                }
            } else if matches_pattern(pattern, &full_host) {
                matched = true;
            }
        }
        matched
    }

    /// Parses one line. Returns `Ok(None)` for blank, comment and
    /// `@cert-authority` lines.
    pub fn parse_line(line: &str) -> PiperResult<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace().peekable();
        let mut revoked = false;
        if let Some(marker) = parts.peek().filter(|p| p.starts_with('@')) {
            match *marker {
                "@revoked" => revoked = true,
                "@cert-authority" => return Ok(None),
                other => {
                    return Err(PiperError::Config(format!(
                        "unknown known_hosts marker {}",
                        other
                    )))
                }
            }
            parts.next();
        }

        let (Some(hostname_pattern), Some(key_type), Some(encoded)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(PiperError::Config(
                "invalid known_hosts line: need hostnames, key type and key".to_string(),
            ));
        };

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| PiperError::Config(format!("invalid base64 key data: {}", e)))?;

        Ok(Some(Self {
            hostname_pattern: hostname_pattern.to_string(),
            key_type: key_type.to_string(),
            key_data,
            revoked,
        }))
    }
}

fn matches_pattern(pattern: &str, hostname: &str) -> bool {
    if pattern.starts_with("|1|") {
        return verify_hashed_hostname(pattern, hostname);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern.as_bytes(), hostname.as_bytes());
    }
    pattern == hostname
}

/// `|1|salt|hash` where hash = Base64(HMAC-SHA1(salt, hostname)).
fn verify_hashed_hostname(hashed: &str, hostname: &str) -> bool {
    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return false;
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let (Ok(salt), Ok(expected)) = (engine.decode(parts[2]), engine.decode(parts[3])) else {
        return false;
    };

    let Ok(mut hmac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    hmac.update(hostname.as_bytes());
    let computed = hmac.finalize().into_bytes();
    computed.ct_eq(&expected[..]).into()
}

/// `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Outcome of checking a host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Host key is known and matches.
    Known,
    /// The host is known with a different key of the same type, or the
    /// presented key is revoked.
    Changed,
    /// No entry for this host and key type.
    Unknown,
}

/// Parsed known_hosts data.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHost>,
}

impl KnownHosts {
    /// Parses known_hosts content.
    pub fn parse(content: &str) -> PiperResult<Self> {
        let mut entries = Vec::new();
        for (number, line) in content.lines().enumerate() {
            match KnownHost::parse_line(line) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => {
                    return Err(PiperError::Config(format!(
                        "known_hosts line {}: {}",
                        number + 1,
                        e
                    )))
                }
            }
        }
        Ok(Self { entries })
    }

    /// Returns all entries.
    pub fn entries(&self) -> &[KnownHost] {
        &self.entries
    }

    /// Checks a host key blob presented by `hostname:port`.
    pub fn verify(&self, hostname: &str, port: u16, key_blob: &[u8]) -> HostKeyStatus {
        let Ok(key_type) = blob_key_type(key_blob) else {
            return HostKeyStatus::Changed;
        };

        let mut status = HostKeyStatus::Unknown;
        for entry in self.entries.iter().filter(|e| e.matches(hostname, port)) {
            if entry.revoked {
                if entry.key_data == key_blob {
                    return HostKeyStatus::Changed;
                }
                continue;
            }
            if entry.key_type != key_type {
                continue;
            }
            if entry.key_data == key_blob {
                status = HostKeyStatus::Known;
            } else if status == HostKeyStatus::Unknown {
                status = HostKeyStatus::Changed;
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::privatekey::PrivateKey;

    fn line(hosts: &str, blob: &[u8]) -> String {
        format!(
            "{} ssh-ed25519 {} comment",
            hosts,
            base64::engine::general_purpose::STANDARD.encode(blob)
        )
    }

    #[test]
    fn test_parse_skips_comments_and_ca_lines() {
        let blob = PrivateKey::generate_ed25519().public_key().to_blob();
        let content = format!(
            "# comment\n\n@cert-authority *.example.com {}\n{}\n",
            line("", &blob).trim(),
            line("example.com", &blob)
        );
        let known = KnownHosts::parse(&content).unwrap();
        assert_eq!(known.entries().len(), 1);
        assert_eq!(known.entries()[0].hostname_pattern(), "example.com");
    }

    #[test]
    fn test_parse_errors() {
        assert!(KnownHosts::parse("example.com ssh-ed25519").is_err());
        assert!(KnownHosts::parse("example.com ssh-ed25519 !!!").is_err());
        assert!(KnownHosts::parse("@weird example.com ssh-ed25519 AAAA").is_err());
    }

    #[test]
    fn test_verify_known_changed_unknown() {
        let key = PrivateKey::generate_ed25519().public_key().to_blob();
        let other = PrivateKey::generate_ed25519().public_key().to_blob();
        let known = KnownHosts::parse(&line("example.com,[10.0.0.1]:2222", &key)).unwrap();

        assert_eq!(known.verify("example.com", 22, &key), HostKeyStatus::Known);
        assert_eq!(known.verify("10.0.0.1", 2222, &key), HostKeyStatus::Known);
        assert_eq!(known.verify("10.0.0.1", 22, &key), HostKeyStatus::Unknown);
        assert_eq!(known.verify("example.com", 22, &other), HostKeyStatus::Changed);
        assert_eq!(known.verify("other.com", 22, &key), HostKeyStatus::Unknown);
    }

    #[test]
    fn test_wildcard_and_negation() {
        let key = PrivateKey::generate_ed25519().public_key().to_blob();
        let known = KnownHosts::parse(&line("*.example.com,!bad.example.com", &key)).unwrap();
        assert_eq!(known.verify("a.example.com", 22, &key), HostKeyStatus::Known);
        assert_eq!(known.verify("bad.example.com", 22, &key), HostKeyStatus::Unknown);
        assert!(wildcard_match(b"h?st*", b"host-1"));
        assert!(!wildcard_match(b"h?st", b"hoost"));
    }

    #[test]
    fn test_hashed_hostname() {
        let salt = [7u8; 20];
        let mut hmac = Hmac::<Sha1>::new_from_slice(&salt).unwrap();
        hmac.update(b"example.com");
        let engine = base64::engine::general_purpose::STANDARD;
        let pattern = format!(
            "|1|{}|{}",
            engine.encode(salt),
            engine.encode(hmac.finalize().into_bytes())
        );

        let key = PrivateKey::generate_ed25519().public_key().to_blob();
        let known = KnownHosts::parse(&line(&pattern, &key)).unwrap();
        assert_eq!(known.verify("example.com", 22, &key), HostKeyStatus::Known);
        assert_eq!(known.verify("example.org", 22, &key), HostKeyStatus::Unknown);
    }

    #[test]
    fn test_revoked_key() {
        let key = PrivateKey::generate_ed25519().public_key().to_blob();
        let content = format!("@revoked {}\n{}", line("*", &key), line("example.com", &key));
        let known = KnownHosts::parse(&content).unwrap();
        assert_eq!(known.verify("example.com", 22, &key), HostKeyStatus::Changed);
    }
}
