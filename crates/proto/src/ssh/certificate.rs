//! OpenSSH user certificates presented during downstream publickey auth.
//!
//! A certificate blob (`ssh-ed25519-cert-v01@openssh.com` and friends) is
//! accepted when:
//! 1. It parses as an OpenSSH certificate
//! 2. Its type is `User`
//! 3. Its CA signature verifies against a trusted CA key and the current time
//!    is inside its validity window
//! 4. Its principals include the downstream user, or it lists none
//! 5. It carries no unrecognized critical option
//!
//! The auth signature itself is then checked against the certified key.

use super::hostkey::PublicKey;
use piper_platform::{PiperError, PiperResult};
use ssh_key::certificate::CertType;
use ssh_key::{Certificate, Fingerprint, HashAlg};
use tracing::debug;

const CERT_SUFFIX: &str = "-cert-v01@openssh.com";

const RECOGNIZED_CRITICAL_OPTIONS: [&str; 3] =
    ["force-command", "source-address", "verify-required"];

/// Whether `algorithm` names an OpenSSH certificate type.
pub fn is_certificate_algorithm(algorithm: &str) -> bool {
    algorithm.ends_with(CERT_SUFFIX)
}

/// The plain signature algorithm used with a certificate algorithm, e.g.
/// `rsa-sha2-512-cert-v01@openssh.com` signs with `rsa-sha2-512`.
pub fn signature_algorithm(algorithm: &str) -> Option<&str> {
    algorithm.strip_suffix(CERT_SUFFIX)
}

/// Validates a user certificate blob for `user` against trusted CA key
/// blobs, returning the certified public key.
pub fn validate_user_certificate(
    blob: &[u8],
    user: &str,
    trusted_ca_keys: &[Vec<u8>],
) -> PiperResult<PublicKey> {
    let cert = Certificate::from_bytes(blob)
        .map_err(|e| PiperError::Auth(format!("malformed certificate: {}", e)))?;

    if cert.cert_type() != CertType::User {
        return Err(PiperError::Auth(format!(
            "certificate {} is not a user certificate",
            cert.key_id()
        )));
    }

    let fingerprints: Vec<Fingerprint> = trusted_ca_keys
        .iter()
        .filter_map(|ca| match ssh_key::PublicKey::from_bytes(ca) {
            Ok(key) => Some(key.fingerprint(HashAlg::Sha256)),
            Err(e) => {
                debug!(error = %e, "skipping unparseable CA key");
                None
            }
        })
        .collect();
    if fingerprints.is_empty() {
        return Err(PiperError::Auth("no trusted user CA keys".to_string()));
    }

    cert.validate(fingerprints.iter()).map_err(|e| {
        PiperError::Auth(format!(
            "certificate {} failed validation: {}",
            cert.key_id(),
            e
        ))
    })?;

    let principals = cert.valid_principals();
    if !principals.is_empty() && !principals.iter().any(|p| p == user) {
        return Err(PiperError::Auth(format!(
            "user {} not among principals of certificate {}",
            user,
            cert.key_id()
        )));
    }

    if let Some((name, _)) = cert
        .critical_options()
        .iter()
        .find(|(name, _)| !RECOGNIZED_CRITICAL_OPTIONS.contains(&name.as_str()))
    {
        return Err(PiperError::Auth(format!(
            "certificate {} carries unknown critical option {}",
            cert.key_id(),
            name
        )));
    }

    let inner = ssh_key::PublicKey::from(cert.public_key().clone())
        .to_bytes()
        .map_err(|e| PiperError::Auth(format!("cannot encode certified key: {}", e)))?;

    debug!(
        user = %user,
        key_id = %cert.key_id(),
        serial = cert.serial(),
        "user certificate accepted"
    );
    PublicKey::from_blob(&inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::private::{Ed25519Keypair, Ed25519PrivateKey, KeypairData};
    use ssh_key::public::{Ed25519PublicKey, KeyData};

    fn ca() -> ssh_key::PrivateKey {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let keypair = KeypairData::Ed25519(Ed25519Keypair {
            public: Ed25519PublicKey(signing.verifying_key().to_bytes()),
            private: Ed25519PrivateKey::from_bytes(&signing.to_bytes()),
        });
        ssh_key::PrivateKey::new(keypair, "ca").unwrap()
    }

    fn issue(
        ca: &ssh_key::PrivateKey,
        user_key: &[u8; 32],
        cert_type: CertType,
        principal: Option<&str>,
        valid: (u64, u64),
    ) -> Vec<u8> {
        let mut builder = ssh_key::certificate::Builder::new_with_random_nonce(
            &mut rand::rngs::OsRng,
            KeyData::Ed25519(Ed25519PublicKey(*user_key)),
            valid.0,
            valid.1,
        )
        .unwrap();
        builder.serial(7).unwrap();
        builder.key_id("test-cert").unwrap();
        builder.cert_type(cert_type).unwrap();
        match principal {
            Some(p) => builder.valid_principal(p).unwrap(),
            None => builder.all_principals_valid().unwrap(),
        };
        builder.sign(ca).unwrap().to_bytes().unwrap()
    }

    fn ca_blob(ca: &ssh_key::PrivateKey) -> Vec<u8> {
        ca.public_key().to_bytes().unwrap()
    }

    const ALWAYS: (u64, u64) = (0, 0xFFFF_FFFF_FFFE);

    #[test]
    fn test_algorithm_names() {
        assert!(is_certificate_algorithm("ssh-ed25519-cert-v01@openssh.com"));
        assert!(!is_certificate_algorithm("ssh-ed25519"));
        assert_eq!(
            signature_algorithm("rsa-sha2-512-cert-v01@openssh.com"),
            Some("rsa-sha2-512")
        );
        assert_eq!(signature_algorithm("ssh-ed25519"), None);
    }

    #[test]
    fn test_valid_user_certificate() {
        let ca = ca();
        let user_key = [9u8; 32];
        let cert = issue(&ca, &user_key, CertType::User, Some("alice"), ALWAYS);

        let inner = validate_user_certificate(&cert, "alice", &[ca_blob(&ca)]).unwrap();
        assert_eq!(inner, PublicKey::Ed25519(user_key));
        assert!(validate_user_certificate(&cert, "bob", &[ca_blob(&ca)]).is_err());
    }

    #[test]
    fn test_empty_principals_match_anyone() {
        let ca = ca();
        let cert = issue(&ca, &[3u8; 32], CertType::User, None, ALWAYS);
        assert!(validate_user_certificate(&cert, "alice", &[ca_blob(&ca)]).is_ok());
        assert!(validate_user_certificate(&cert, "bob", &[ca_blob(&ca)]).is_ok());
    }

    #[test]
    fn test_host_certificate_rejected() {
        let ca = ca();
        let cert = issue(&ca, &[3u8; 32], CertType::Host, None, ALWAYS);
        assert!(matches!(
            validate_user_certificate(&cert, "alice", &[ca_blob(&ca)]),
            Err(PiperError::Auth(_))
        ));
    }

    #[test]
    fn test_untrusted_ca_rejected() {
        let signer = ca();
        let other = ca();
        let cert = issue(&signer, &[3u8; 32], CertType::User, Some("alice"), ALWAYS);
        assert!(validate_user_certificate(&cert, "alice", &[ca_blob(&other)]).is_err());
        assert!(validate_user_certificate(&cert, "alice", &[]).is_err());
    }

    #[test]
    fn test_expired_certificate_rejected() {
        let ca = ca();
        let cert = issue(&ca, &[3u8; 32], CertType::User, Some("alice"), (1, 2));
        assert!(validate_user_certificate(&cert, "alice", &[ca_blob(&ca)]).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(validate_user_certificate(b"not a certificate", "alice", &[]).is_err());
    }
}
