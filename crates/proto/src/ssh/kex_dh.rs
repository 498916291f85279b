//! Diffie-Hellman key exchange (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 / curve25519-sha256@libssh.org (RFC 8731)
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - the exchange hash H and key derivation (RFC 4253 Section 7.2)
//!
//! # Security
//!
//! - DH Group14: 2048-bit MODP group, peer values checked to lie in (1, p-1)
//! - Curve25519: constant-time operations via `ring`
//! - Private exponents are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::kex::KexAlgorithm;
//! use piper_proto::ssh::kex_dh::EphemeralKex;
//!
//! let client = EphemeralKex::new(KexAlgorithm::Curve25519Sha256).unwrap();
//! let server = EphemeralKex::new(KexAlgorithm::Curve25519Sha256).unwrap();
//! let q_c = client.public_value();
//! let q_s = server.public_value();
//!
//! assert_eq!(client.agree(&q_s).unwrap(), server.agree(&q_c).unwrap());
//! ```

use super::crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm};
use super::kex::KexAlgorithm;
use super::wire::{encode_mpint, write_string};
use piper_platform::{PiperError, PiperResult};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Diffie-Hellman Group 14 parameters (RFC 3526).
///
/// This is a 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    const PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
        29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
        EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
        E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
        EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
        C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
        83655D23DCA3AD961C62F356208552BB9ED529077096966D\
        670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
        E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
        DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
        15728E5A8AACAA68FFFFFFFFFFFFFFFF";

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(PRIME_HEX, 16).expect("RFC 3526 prime is valid hex")
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    /// Private key (x)
    private_key: Vec<u8>,
    /// Public key (g^x mod p)
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a new ephemeral key pair.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};

        let mut rng = rand::thread_rng();

        // 1 < x < p-1
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value as an unsigned big-endian magnitude.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret K from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`PiperError::Handshake`] if the peer value is outside (1, p-1).
    ///
    /// # Example
    ///
    /// ```rust
    /// use piper_proto::ssh::kex_dh::DhGroup14Exchange;
    ///
    /// let client = DhGroup14Exchange::new();
    /// let server = DhGroup14Exchange::new();
    ///
    /// let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
    /// let server_secret = server.compute_shared_secret(client.public_key()).unwrap();
    /// assert_eq!(client_secret, server_secret);
    /// ```
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> PiperResult<Vec<u8>> {
        use num_bigint::BigUint;

        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;
        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(PiperError::Handshake(
                "DH peer public value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(y_peer.modpow(&x, &dh_group14::P).to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a new ephemeral key pair.
    pub fn new() -> PiperResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| PiperError::Handshake("failed to generate X25519 key".to_string()))?;
        let public_key = private_key.compute_public_key().map_err(|_| {
            PiperError::Handshake("failed to compute X25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the public key (32 bytes).
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the private key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> PiperResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(PiperError::Handshake(format!(
                "X25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| PiperError::Handshake("X25519 key agreement failed".to_string()))
    }
}

/// One side's ephemeral state for the negotiated exchange method.
pub enum EphemeralKex {
    /// curve25519-sha256
    Curve25519(Curve25519Exchange),
    /// diffie-hellman-group14-sha256
    DhGroup14(DhGroup14Exchange),
}

impl EphemeralKex {
    /// Generates a key pair for `algorithm`.
    pub fn new(algorithm: KexAlgorithm) -> PiperResult<Self> {
        Ok(match algorithm {
            KexAlgorithm::Curve25519Sha256 => EphemeralKex::Curve25519(Curve25519Exchange::new()?),
            KexAlgorithm::DhGroup14Sha256 => EphemeralKex::DhGroup14(DhGroup14Exchange::new()),
        })
    }

    /// The public value as carried in KEX_ECDH_INIT/KEXDH_INIT: the raw
    /// point for Curve25519, the magnitude of `e`/`f` for group14.
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            EphemeralKex::Curve25519(x) => x.public_key().to_vec(),
            EphemeralKex::DhGroup14(dh) => dh.public_key().to_vec(),
        }
    }

    /// Whether public values are carried as `mpint` rather than `string`.
    pub fn uses_mpint(&self) -> bool {
        matches!(self, EphemeralKex::DhGroup14(_))
    }

    /// Computes the shared secret K as an unsigned magnitude.
    pub fn agree(self, peer_public: &[u8]) -> PiperResult<Vec<u8>> {
        let secret = match self {
            EphemeralKex::Curve25519(x) => x.compute_shared_secret(peer_public)?,
            EphemeralKex::DhGroup14(dh) => dh.compute_shared_secret(peer_public)?,
        };
        if secret.iter().all(|&b| b == 0) {
            return Err(PiperError::Handshake("shared secret is zero".to_string()));
        }
        Ok(secret)
    }
}

/// Inputs of the exchange hash H.
pub struct ExchangeHashInput<'a> {
    /// Client identification line (without CR LF)
    pub client_version: &'a [u8],
    /// Server identification line (without CR LF)
    pub server_version: &'a [u8],
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// Server host key blob
    pub host_key: &'a [u8],
    /// Client public value
    pub client_public: &'a [u8],
    /// Server public value
    pub server_public: &'a [u8],
    /// Shared secret magnitude
    pub shared_secret: &'a [u8],
}

/// Computes H = SHA-256 over the exchange transcript.
///
/// Public values are hashed as `string` for Curve25519 and as `mpint` for
/// group14.
pub fn exchange_hash(algorithm: KexAlgorithm, input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2048);
    write_string(&mut buf, input.client_version);
    write_string(&mut buf, input.server_version);
    write_string(&mut buf, input.client_kexinit);
    write_string(&mut buf, input.server_kexinit);
    write_string(&mut buf, input.host_key);
    match algorithm {
        KexAlgorithm::Curve25519Sha256 => {
            write_string(&mut buf, input.client_public);
            write_string(&mut buf, input.server_public);
        }
        KexAlgorithm::DhGroup14Sha256 => {
            buf.extend_from_slice(&encode_mpint(input.client_public));
            buf.extend_from_slice(&encode_mpint(input.server_public));
        }
    }
    buf.extend_from_slice(&encode_mpint(input.shared_secret));
    Sha256::digest(&buf).to_vec()
}

/// Derives SSH session keys from shared secret (RFC 4253 Section 7.2).
///
/// # Key Derivation
///
/// ```text
/// Initial IV client to server:     HASH(K || H || "A" || session_id)
/// Initial IV server to client:     HASH(K || H || "B" || session_id)
/// Encryption key client to server: HASH(K || H || "C" || session_id)
/// Encryption key server to client: HASH(K || H || "D" || session_id)
/// Integrity key client to server:  HASH(K || H || "E" || session_id)
/// Integrity key server to client:  HASH(K || H || "F" || session_id)
/// ```
///
/// Longer keys are extended with `HASH(K || H || K1 || K2 ...)`.
///
/// # Example
///
/// ```rust
/// use piper_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = encode_mpint(shared_secret);
    let mut hasher = Sha256::new();

    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([key_type]);
    hasher.update(session_id);
    let mut key = hasher.finalize_reset().to_vec();

    while key.len() < key_length {
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize_reset();
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

/// Which half of the letter table a direction uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Letters A, C, E
    ClientToServer,
    /// Letters B, D, F
    ServerToClient,
}

/// Derives the key set for one direction.
pub fn derive_direction_keys(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    direction: Direction,
    cipher: CipherAlgorithm,
    mac: Option<MacAlgorithm>,
) -> DirectionKeys {
    let (iv_letter, key_letter, mac_letter) = match direction {
        Direction::ClientToServer => (b'A', b'C', b'E'),
        Direction::ServerToClient => (b'B', b'D', b'F'),
    };
    let derive = |letter, len| derive_key(shared_secret, exchange_hash, session_id, letter, len);

    DirectionKeys {
        cipher,
        mac,
        iv: derive(iv_letter, cipher.iv_size()),
        key: derive(key_letter, cipher.key_size()),
        mac_key: mac.map(|m| derive(mac_letter, m.key_size())).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{PacketOpener, PacketSealer};

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(client_secret, server_secret);
        assert!(!client_secret.is_empty());
    }

    #[test]
    fn test_dh_group14_invalid_peer_key() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange.compute_shared_secret(&[]).is_err());

        let p_minus_one = (dh_group14::P.clone() - 1u32).to_bytes_be();
        assert!(exchange.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = EphemeralKex::new(KexAlgorithm::Curve25519Sha256).unwrap();
        let server = EphemeralKex::new(KexAlgorithm::Curve25519Sha256).unwrap();
        assert!(!client.uses_mpint());

        let q_c = client.public_value();
        let q_s = server.public_value();
        assert_eq!(q_c.len(), 32);

        let client_secret = client.agree(&q_s).unwrap();
        let server_secret = server.agree(&q_c).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_curve25519_rejects_bad_length() {
        let exchange = EphemeralKex::new(KexAlgorithm::Curve25519Sha256).unwrap();
        assert!(exchange.agree(&[9u8; 31]).is_err());
    }

    #[test]
    fn test_exchange_hash_depends_on_every_input() {
        let input = ExchangeHashInput {
            client_version: b"SSH-2.0-a",
            server_version: b"SSH-2.0-b",
            client_kexinit: b"\x14c",
            server_kexinit: b"\x14s",
            host_key: b"key",
            // High bit set so mpint and string encodings differ
            client_public: &[0x81u8; 32],
            server_public: &[0x82u8; 32],
            shared_secret: &[0x83u8; 32],
        };
        let h = exchange_hash(KexAlgorithm::Curve25519Sha256, &input);
        assert_eq!(h.len(), 32);

        let other = ExchangeHashInput {
            server_version: b"SSH-2.0-c",
            ..input
        };
        assert_ne!(h, exchange_hash(KexAlgorithm::Curve25519Sha256, &other));
        assert_ne!(h, exchange_hash(KexAlgorithm::DhGroup14Sha256, &input));
    }

    #[test]
    fn test_derive_key_extension_prefix() {
        let short = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 32);
        let long = derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'C', 64);
        assert_eq!(&long[..32], &short[..]);
        assert_ne!(
            short,
            derive_key(&[0x42; 32], &[0x01; 32], &[0x02; 32], b'A', 32)
        );
    }

    #[test]
    fn test_direction_keys_interoperate() {
        let secret = [7u8; 32];
        let h = [8u8; 32];
        for cipher in CipherAlgorithm::ALL {
            let mac = if cipher.is_aead() {
                None
            } else {
                Some(MacAlgorithm::HmacSha256Etm)
            };
            let keys =
                derive_direction_keys(&secret, &h, &h, Direction::ClientToServer, cipher, mac);
            assert_eq!(keys.key.len(), cipher.key_size());
            assert_eq!(keys.iv.len(), cipher.iv_size());

            let mut sealer = PacketSealer::new(&keys).unwrap();
            let mut opener = PacketOpener::new(&keys).unwrap();
            let mut wire = sealer.seal(3, b"\x02hello").unwrap();
            let header_len = opener.header_len();
            let length = opener.packet_length(3, &mut wire[..header_len]).unwrap();
            assert_eq!(opener.open(3, &mut wire, length).unwrap(), b"\x02hello");
        }
    }
}
