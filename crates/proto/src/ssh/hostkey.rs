//! SSH public keys and signature verification (RFC 4253 Section 6.6).
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519
//! - `rsa-sha2-256`, `rsa-sha2-512` - RSA PKCS#1 v1.5 (RFC 8332)
//! - `ssh-rsa` - RSA with SHA-1, accepted for verification only
//! - `ecdsa-sha2-nistp256`, `-nistp384`, `-nistp521` (RFC 5656)
//!
//! Keys travel as opaque blobs (`string type, ...`); [`PublicKey`] parses
//! them into their components. Signatures are verified against the exact
//! algorithm named on the wire.
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::hostkey::PublicKey;
//! use piper_proto::ssh::privatekey::PrivateKey;
//!
//! let key = PrivateKey::generate_ed25519();
//! let blob = key.public_key().to_blob();
//! let signature = key.sign("ssh-ed25519", b"data").unwrap();
//!
//! let public = PublicKey::from_blob(&blob).unwrap();
//! assert!(public.verify("ssh-ed25519", b"data", &signature));
//! assert!(public.fingerprint().starts_with("SHA256:"));
//! ```

use super::wire::{
    expect_end, read_mpint, read_string, read_utf8, write_mpint, write_str, write_string,
};
use base64::Engine;
use piper_platform::{PiperError, PiperResult};
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use signature::Verifier;

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// rsa-sha2-256
    RsaSha2_256,
    /// rsa-sha2-512
    RsaSha2_512,
    /// ssh-rsa (SHA-1, verification only)
    SshRsa,
    /// ecdsa-sha2-nistp256
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384
    EcdsaSha2Nistp384,
    /// ecdsa-sha2-nistp521
    EcdsaSha2Nistp521,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaSha2Nistp521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaSha2Nistp384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaSha2Nistp521),
            _ => None,
        }
    }

    /// The key type a signature of this algorithm is made with.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_256
            | HostKeyAlgorithm::RsaSha2_512
            | HostKeyAlgorithm::SshRsa => "ssh-rsa",
            other => other.name(),
        }
    }
}

/// NIST curves used by ECDSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaCurve {
    /// P-256
    NistP256,
    /// P-384
    NistP384,
    /// P-521
    NistP521,
}

impl EcdsaCurve {
    /// Curve identifier inside the key blob.
    pub fn identifier(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => "nistp256",
            EcdsaCurve::NistP384 => "nistp384",
            EcdsaCurve::NistP521 => "nistp521",
        }
    }

    /// Key type and signature algorithm name.
    pub fn algorithm(&self) -> HostKeyAlgorithm {
        match self {
            EcdsaCurve::NistP256 => HostKeyAlgorithm::EcdsaSha2Nistp256,
            EcdsaCurve::NistP384 => HostKeyAlgorithm::EcdsaSha2Nistp384,
            EcdsaCurve::NistP521 => HostKeyAlgorithm::EcdsaSha2Nistp521,
        }
    }

    /// Size of a scalar in bytes.
    pub fn field_size(&self) -> usize {
        match self {
            EcdsaCurve::NistP256 => 32,
            EcdsaCurve::NistP384 => 48,
            EcdsaCurve::NistP521 => 66,
        }
    }

    fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "nistp256" => Some(EcdsaCurve::NistP256),
            "nistp384" => Some(EcdsaCurve::NistP384),
            "nistp521" => Some(EcdsaCurve::NistP521),
            _ => None,
        }
    }
}

/// SSH public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 public key (32 bytes)
    Ed25519([u8; 32]),
    /// RSA public key
    Rsa {
        /// Public exponent
        e: Vec<u8>,
        /// Modulus
        n: Vec<u8>,
    },
    /// ECDSA public key
    Ecdsa {
        /// Curve
        curve: EcdsaCurve,
        /// SEC1 encoded point
        point: Vec<u8>,
    },
}

impl PublicKey {
    /// Parses a key blob.
    pub fn from_blob(blob: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        let key_type = read_utf8(blob, &mut offset)?;

        let key = match key_type.as_str() {
            "ssh-ed25519" => {
                let raw = read_string(blob, &mut offset)?;
                let bytes: [u8; 32] = raw.try_into().map_err(|_| {
                    PiperError::Protocol(format!("ed25519 key must be 32 bytes, got {}", raw.len()))
                })?;
                PublicKey::Ed25519(bytes)
            }
            "ssh-rsa" => {
                let e = read_mpint(blob, &mut offset)?.to_vec();
                let n = read_mpint(blob, &mut offset)?.to_vec();
                PublicKey::Rsa { e, n }
            }
            other if other.starts_with("ecdsa-sha2-") => {
                let identifier = read_utf8(blob, &mut offset)?;
                let curve = EcdsaCurve::from_identifier(&identifier)
                    .filter(|c| c.algorithm().name() == other)
                    .ok_or_else(|| {
                        PiperError::Protocol(format!(
                            "curve {} does not match {}",
                            identifier, other
                        ))
                    })?;
                let point = read_string(blob, &mut offset)?.to_vec();
                PublicKey::Ecdsa { curve, point }
            }
            other => {
                return Err(PiperError::Protocol(format!(
                    "unsupported public key type {}",
                    other
                )))
            }
        };

        expect_end(blob, offset, "public key")?;
        Ok(key)
    }

    /// Parses the `type base64 [comment]` form used in authorized_keys and
    /// `.pub` files.
    pub fn from_openssh(line: &str) -> PiperResult<Self> {
        let mut fields = line.split_whitespace();
        let key_type = fields
            .next()
            .ok_or_else(|| PiperError::Config("empty public key line".to_string()))?;
        let encoded = fields
            .next()
            .ok_or_else(|| PiperError::Config("public key line has no key data".to_string()))?;
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| PiperError::Config(format!("invalid base64 in public key: {}", e)))?;
        let key = Self::from_blob(&blob)?;
        if key.key_type() != key_type {
            return Err(PiperError::Config(format!(
                "public key type {} does not match blob type {}",
                key_type,
                key.key_type()
            )));
        }
        Ok(key)
    }

    /// Key type name as it appears at the start of the blob.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
            PublicKey::Ecdsa { curve, .. } => curve.algorithm().name(),
        }
    }

    /// Encodes the key blob.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_str(&mut buf, self.key_type());
        match self {
            PublicKey::Ed25519(bytes) => write_string(&mut buf, bytes),
            PublicKey::Rsa { e, n } => {
                write_mpint(&mut buf, e);
                write_mpint(&mut buf, n);
            }
            PublicKey::Ecdsa { curve, point } => {
                write_str(&mut buf, curve.identifier());
                write_string(&mut buf, point);
            }
        }
        buf
    }

    /// Signature algorithms a host presenting this key can offer, best first.
    pub fn signature_algorithms(&self) -> Vec<HostKeyAlgorithm> {
        match self {
            PublicKey::Ed25519(_) => vec![HostKeyAlgorithm::SshEd25519],
            PublicKey::Rsa { .. } => {
                vec![HostKeyAlgorithm::RsaSha2_512, HostKeyAlgorithm::RsaSha2_256]
            }
            PublicKey::Ecdsa { curve, .. } => vec![curve.algorithm()],
        }
    }

    /// `SHA256:` fingerprint as printed by `ssh-keygen -l`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.to_blob())
    }

    /// Verifies a signature blob (`string algorithm, string signature`)
    /// made with `algorithm` over `data`.
    ///
    /// Malformed signatures, algorithm mismatches and bad signatures all
    /// yield `false`.
    pub fn verify(&self, algorithm: &str, data: &[u8], signature: &[u8]) -> bool {
        self.try_verify(algorithm, data, signature).unwrap_or(false)
    }

    fn try_verify(&self, algorithm: &str, data: &[u8], signature: &[u8]) -> PiperResult<bool> {
        let mut offset = 0;
        let sig_algorithm = read_utf8(signature, &mut offset)?;
        let raw = read_string(signature, &mut offset)?;
        expect_end(signature, offset, "signature")?;

        if sig_algorithm != algorithm {
            return Ok(false);
        }
        let algorithm = match HostKeyAlgorithm::from_name(algorithm) {
            Some(alg) if alg.key_type() == self.key_type() => alg,
            _ => return Ok(false),
        };

        Ok(match self {
            PublicKey::Ed25519(bytes) => {
                let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
                    .map_err(|e| PiperError::Protocol(format!("invalid ed25519 key: {}", e)))?;
                let sig = ed25519_dalek::Signature::from_slice(raw)
                    .map_err(|e| {
                        PiperError::Protocol(format!("invalid ed25519 signature: {}", e))
                    })?;
                key.verify(data, &sig).is_ok()
            }
            PublicKey::Rsa { e, n } => {
                let params = match algorithm {
                    HostKeyAlgorithm::RsaSha2_256 => &RSA_PKCS1_2048_8192_SHA256,
                    HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
                    _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
                };
                RsaPublicKeyComponents { n, e }.verify(params, data, raw).is_ok()
            }
            PublicKey::Ecdsa { curve, point } => verify_ecdsa(*curve, point, data, raw)?,
        })
    }
}

/// `SHA256:` fingerprint of a key blob.
pub fn fingerprint(blob: &[u8]) -> String {
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(Sha256::digest(blob))
    )
}

/// Key type named at the start of a blob, without parsing the rest.
pub fn blob_key_type(blob: &[u8]) -> PiperResult<String> {
    let mut offset = 0;
    read_utf8(blob, &mut offset)
}

fn verify_ecdsa(curve: EcdsaCurve, point: &[u8], data: &[u8], raw: &[u8]) -> PiperResult<bool> {
    let mut offset = 0;
    let r = read_mpint(raw, &mut offset)?;
    let s = read_mpint(raw, &mut offset)?;
    expect_end(raw, offset, "ecdsa signature")?;

    let size = curve.field_size();
    if r.len() > size || s.len() > size {
        return Ok(false);
    }
    let mut fixed = vec![0u8; size * 2];
    fixed[size - r.len()..size].copy_from_slice(r);
    fixed[2 * size - s.len()..].copy_from_slice(s);

    let bad_key = |e: signature::Error| PiperError::Protocol(format!("invalid ecdsa key: {}", e));
    Ok(match curve {
        EcdsaCurve::NistP256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(bad_key)?;
            match p256::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        EcdsaCurve::NistP384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(bad_key)?;
            match p384::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        EcdsaCurve::NistP521 => {
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(bad_key)?;
            match p521::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::privatekey::PrivateKey;

    #[test]
    fn test_algorithm_names() {
        for alg in [
            HostKeyAlgorithm::SshEd25519,
            HostKeyAlgorithm::RsaSha2_256,
            HostKeyAlgorithm::RsaSha2_512,
            HostKeyAlgorithm::SshRsa,
            HostKeyAlgorithm::EcdsaSha2Nistp256,
            HostKeyAlgorithm::EcdsaSha2Nistp384,
            HostKeyAlgorithm::EcdsaSha2Nistp521,
        ] {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(HostKeyAlgorithm::RsaSha2_512.key_type(), "ssh-rsa");
        assert_eq!(HostKeyAlgorithm::from_name("ssh-dss"), None);
    }

    #[test]
    fn test_ed25519_blob_and_verify() {
        let key = PrivateKey::generate_ed25519();
        let public = key.public_key();
        let blob = public.to_blob();
        assert_eq!(PublicKey::from_blob(&blob).unwrap(), public);
        assert_eq!(blob_key_type(&blob).unwrap(), "ssh-ed25519");

        let sig = key.sign("ssh-ed25519", b"exchange hash").unwrap();
        assert!(public.verify("ssh-ed25519", b"exchange hash", &sig));
        assert!(!public.verify("ssh-ed25519", b"other data", &sig));
        assert!(!public.verify("rsa-sha2-256", b"exchange hash", &sig));
        assert!(!public.verify("ssh-ed25519", b"exchange hash", b"garbage"));
    }

    #[test]
    fn test_ecdsa_verify() {
        let key = PrivateKey::EcdsaP256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng));
        let public = key.public_key();
        assert_eq!(public.key_type(), "ecdsa-sha2-nistp256");

        let sig = key.sign("ecdsa-sha2-nistp256", b"payload").unwrap();
        assert!(public.verify("ecdsa-sha2-nistp256", b"payload", &sig));
        assert!(!public.verify("ecdsa-sha2-nistp256", b"tampered", &sig));
        assert_eq!(PublicKey::from_blob(&public.to_blob()).unwrap(), public);
    }

    #[test]
    fn test_from_openssh_line() {
        let key = PrivateKey::generate_ed25519();
        let line = format!(
            "ssh-ed25519 {} user@host",
            base64::engine::general_purpose::STANDARD.encode(key.public_key().to_blob())
        );
        assert_eq!(PublicKey::from_openssh(&line).unwrap(), key.public_key());

        let mismatched = line.replacen("ssh-ed25519", "ssh-rsa", 1);
        assert!(PublicKey::from_openssh(&mismatched).is_err());
        assert!(PublicKey::from_openssh("ssh-ed25519 !!!").is_err());
    }

    #[test]
    fn test_rejects_trailing_bytes_and_unknown_types() {
        let mut blob = PrivateKey::generate_ed25519().public_key().to_blob();
        blob.push(0);
        assert!(PublicKey::from_blob(&blob).is_err());

        let mut dss = Vec::new();
        write_str(&mut dss, "ssh-dss");
        assert!(PublicKey::from_blob(&dss).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }
}
