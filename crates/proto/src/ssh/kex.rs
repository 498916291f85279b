//! SSH algorithm negotiation (RFC 4253 Section 7.1).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT encoding and parsing
//! - Algorithm negotiation (first client preference the server also supports)
//! - The algorithm lists the proxy offers in each role
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation
//! 3. Key exchange (see [`crate::ssh::kex_dh`])
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the derived keys
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::kex::KexInit;
//!
//! let kexinit = KexInit::for_client();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//! let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
//! assert_eq!(parsed, kexinit);
//! ```

use super::crypto::{CipherAlgorithm, MacAlgorithm};
use super::message::MessageType;
use super::wire::{
    read_bool, read_name_list, read_u32, read_u8, write_bool, write_name_list, write_u32,
    write_u8,
};
use piper_platform::{PiperError, PiperResult};
use rand::RngCore;

/// Client marker asking the server for SSH_MSG_EXT_INFO (RFC 8308).
pub const EXT_INFO_CLIENT: &str = "ext-info-c";

/// Key exchange methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// curve25519-sha256 (RFC 8731), also known as curve25519-sha256@libssh.org
    Curve25519Sha256,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
}

impl KexAlgorithm {
    /// Names offered in preference order.
    pub const NAMES: [&'static str; 3] = [
        "curve25519-sha256",
        "curve25519-sha256@libssh.org",
        "diffie-hellman-group14-sha256",
    ];

    /// Parses a negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                Some(KexAlgorithm::Curve25519Sha256)
            }
            "diffie-hellman-group14-sha256" => Some(KexAlgorithm::DhGroup14Sha256),
            _ => None,
        }
    }
}

/// Host key signature algorithms the client role accepts, in preference order.
pub const CLIENT_HOST_KEY_ALGORITHMS: [&str; 6] = [
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
];

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server
    languages_client_to_server: Vec<String>,
    /// Languages server to client
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie.
    pub fn new(kex_algorithms: Vec<String>, server_host_key_algorithms: Vec<String>) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers: Vec<String> = CipherAlgorithm::ALL
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let macs: Vec<String> = MacAlgorithm::ALL
            .iter()
            .map(|m| m.name().to_string())
            .collect();

        Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: names(&["none"]),
            compression_algorithms_server_to_client: names(&["none"]),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// KEXINIT sent by the upstream-facing client role.
    pub fn for_client() -> Self {
        Self::new(names(&KexAlgorithm::NAMES), names(&CLIENT_HOST_KEY_ALGORITHMS))
    }

    /// KEXINIT sent by the downstream-facing server role, offering one
    /// signature algorithm per entry of `host_key_algorithms`.
    pub fn for_server(host_key_algorithms: Vec<String>) -> Self {
        Self::new(names(&KexAlgorithm::NAMES), host_key_algorithms)
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether a guessed KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(512);
        write_u8(&mut buf, MessageType::KexInit as u8);
        buf.extend_from_slice(&self.cookie);
        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);
        write_bool(&mut buf, self.first_kex_packet_follows);
        write_u32(&mut buf, 0);
        buf
    }

    /// Parses a KEXINIT payload.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        let mut offset = 0;
        let msg_type = read_u8(data, &mut offset)?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(PiperError::Protocol(format!(
                "expected SSH_MSG_KEXINIT, got {}",
                msg_type
            )));
        }

        let cookie: [u8; 16] = data
            .get(offset..offset + 16)
            .and_then(|c| c.try_into().ok())
            .ok_or_else(|| PiperError::Protocol("KEXINIT too short for cookie".to_string()))?;
        offset += 16;

        let kexinit = Self {
            cookie,
            kex_algorithms: read_name_list(data, &mut offset)?,
            server_host_key_algorithms: read_name_list(data, &mut offset)?,
            encryption_algorithms_client_to_server: read_name_list(data, &mut offset)?,
            encryption_algorithms_server_to_client: read_name_list(data, &mut offset)?,
            mac_algorithms_client_to_server: read_name_list(data, &mut offset)?,
            mac_algorithms_server_to_client: read_name_list(data, &mut offset)?,
            compression_algorithms_client_to_server: read_name_list(data, &mut offset)?,
            compression_algorithms_server_to_client: read_name_list(data, &mut offset)?,
            languages_client_to_server: read_name_list(data, &mut offset)?,
            languages_server_to_client: read_name_list(data, &mut offset)?,
            first_kex_packet_follows: read_bool(data, &mut offset)?,
        };
        // reserved
        read_u32(data, &mut offset)?;

        Ok(kexinit)
    }
}

/// Algorithms agreed for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: KexAlgorithm,
    /// Host key signature algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server (`None` for AEAD)
    pub mac_client_to_server: Option<MacAlgorithm>,
    /// MAC server to client (`None` for AEAD)
    pub mac_server_to_client: Option<MacAlgorithm>,
}

/// Negotiates one algorithm: the first client entry the server also lists.
pub fn negotiate_algorithm(
    what: &str,
    client_list: &[String],
    server_list: &[String],
) -> PiperResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            PiperError::Handshake(format!(
                "no common {} algorithm: client={:?}, server={:?}",
                what, client_list, server_list
            ))
        })
}

fn negotiate_mac(
    cipher: CipherAlgorithm,
    client_list: &[String],
    server_list: &[String],
) -> PiperResult<Option<MacAlgorithm>> {
    if cipher.is_aead() {
        return Ok(None);
    }
    let name = negotiate_algorithm("MAC", client_list, server_list)?;
    MacAlgorithm::from_name(&name)
        .map(Some)
        .ok_or_else(|| PiperError::Handshake(format!("unsupported MAC {}", name)))
}

/// Negotiates every algorithm from both KEXINIT messages.
pub fn negotiate(client: &KexInit, server: &KexInit) -> PiperResult<Negotiated> {
    let kex_name = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let kex = KexAlgorithm::from_name(&kex_name)
        .ok_or_else(|| PiperError::Handshake(format!("unsupported kex {}", kex_name)))?;

    let host_key = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;

    let cipher = |client_list: &[String], server_list: &[String]| -> PiperResult<CipherAlgorithm> {
        let name = negotiate_algorithm("cipher", client_list, server_list)?;
        CipherAlgorithm::from_name(&name)
            .ok_or_else(|| PiperError::Handshake(format!("unsupported cipher {}", name)))
    };
    let cipher_client_to_server = cipher(
        &client.encryption_algorithms_client_to_server,
        &server.encryption_algorithms_client_to_server,
    )?;
    let cipher_server_to_client = cipher(
        &client.encryption_algorithms_server_to_client,
        &server.encryption_algorithms_server_to_client,
    )?;

    let mac_client_to_server = negotiate_mac(
        cipher_client_to_server,
        &client.mac_algorithms_client_to_server,
        &server.mac_algorithms_client_to_server,
    )?;
    let mac_server_to_client = negotiate_mac(
        cipher_server_to_client,
        &client.mac_algorithms_server_to_client,
        &server.mac_algorithms_server_to_client,
    )?;

    negotiate_algorithm(
        "compression",
        &client.compression_algorithms_client_to_server,
        &server.compression_algorithms_client_to_server,
    )?;
    negotiate_algorithm(
        "compression",
        &client.compression_algorithms_server_to_client,
        &server.compression_algorithms_server_to_client,
    )?;

    Ok(Negotiated {
        kex,
        host_key,
        cipher_client_to_server,
        cipher_server_to_client,
        mac_client_to_server,
        mac_server_to_client,
    })
}

/// Whether the sender of a `first_kex_packet_follows` KEXINIT guessed the
/// kex and host key algorithms right (RFC 4253 Section 7).
pub fn guess_was_right(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms.first() == server.kex_algorithms.first()
        && client.server_host_key_algorithms.first() == server.server_host_key_algorithms.first()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_init() -> KexInit {
        KexInit::for_server(vec!["ssh-ed25519".to_string()])
    }

    #[test]
    fn test_kexinit_defaults() {
        let kexinit = KexInit::for_client();
        assert_eq!(kexinit.cookie().len(), 16);
        assert_eq!(kexinit.kex_algorithms()[0], "curve25519-sha256");
        assert!(kexinit
            .server_host_key_algorithms()
            .contains(&"rsa-sha2-256".to_string()));
        assert!(!kexinit.first_kex_packet_follows());
    }

    #[test]
    fn test_kexinit_round_trip() {
        let kexinit = server_init();
        let parsed = KexInit::from_bytes(&kexinit.to_bytes()).unwrap();
        assert_eq!(parsed, kexinit);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut bytes = server_init().to_bytes();
        bytes[0] = 21;
        assert!(matches!(
            KexInit::from_bytes(&bytes),
            Err(PiperError::Protocol(_))
        ));
    }

    #[test]
    fn test_kexinit_parse_too_short() {
        assert!(KexInit::from_bytes(&[20, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let client = KexInit::for_client();
        let server = server_init();
        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, KexAlgorithm::Curve25519Sha256);
        assert_eq!(negotiated.host_key, "ssh-ed25519");
        assert_eq!(
            negotiated.cipher_client_to_server,
            CipherAlgorithm::ChaCha20Poly1305
        );
        assert_eq!(negotiated.mac_client_to_server, None);
    }

    #[test]
    fn test_negotiate_ctr_needs_mac() {
        let mut client = KexInit::for_client();
        client.encryption_algorithms_client_to_server = names(&["aes256-ctr"]);
        client.mac_algorithms_client_to_server = names(&["hmac-sha2-512"]);
        let negotiated = negotiate(&client, &server_init()).unwrap();
        assert_eq!(
            negotiated.cipher_client_to_server,
            CipherAlgorithm::Aes256Ctr
        );
        assert_eq!(
            negotiated.mac_client_to_server,
            Some(MacAlgorithm::HmacSha512)
        );
    }

    #[test]
    fn test_negotiate_no_common_cipher() {
        let mut client = KexInit::for_client();
        client.encryption_algorithms_client_to_server = names(&["3des-cbc"]);
        let err = negotiate(&client, &server_init()).unwrap_err();
        assert!(matches!(err, PiperError::Handshake(_)));
    }

    #[test]
    fn test_negotiate_ignores_pseudo_algorithms() {
        let mut client = KexInit::for_client();
        client.kex_algorithms.insert(0, EXT_INFO_CLIENT.to_string());
        client
            .kex_algorithms
            .insert(0, "sntrup761x25519-sha512@openssh.com".to_string());
        let negotiated = negotiate(&client, &server_init()).unwrap();
        assert_eq!(negotiated.kex, KexAlgorithm::Curve25519Sha256);
    }

    #[test]
    fn test_guess() {
        let client = KexInit::for_client();
        let server = server_init();
        assert!(guess_was_right(&client, &server));

        let mut other = KexInit::for_client();
        other.kex_algorithms = names(&["diffie-hellman-group14-sha256"]);
        assert!(!guess_was_right(&other, &server));
    }
}
