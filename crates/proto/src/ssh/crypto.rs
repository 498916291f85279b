//! SSH packet encryption and integrity.
//!
//! This module turns plaintext packets into wire bytes and back for every
//! negotiated cipher:
//! - chacha20-poly1305@openssh.com (separate header and payload keys)
//! - aes128-gcm@openssh.com, aes256-gcm@openssh.com (length as AAD,
//!   64-bit invocation counter in the nonce)
//! - aes128-ctr, aes256-ctr with hmac-sha2-256/512, either
//!   encrypt-and-MAC or the `-etm@openssh.com` encrypt-then-MAC variants
//!
//! # Security
//!
//! - MACs and tags are checked in constant time before any plaintext is used
//! - Key material is zeroized on drop
//! - Any failure is reported as [`PiperError::Transport`] and is fatal to the
//!   half-transport that produced it

use super::packet::{check_packet_length, Packet, PLAIN_BLOCK_SIZE};
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use piper_platform::{PiperError, PiperResult};
use ring::aead::chacha20_poly1305_openssh as chacha;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Supported ciphers in preference order.
    pub const ALL: [CipherAlgorithm; 5] = [
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Aes128Gcm,
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::Aes128Ctr,
        CipherAlgorithm::Aes256Ctr,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => chacha::KEY_LEN,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Ctr => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes128Gcm => 12,
            CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::Aes256Ctr => 16,
        }
    }

    /// Returns the authentication tag size in bytes (for AEAD ciphers).
    pub fn tag_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => chacha::TAG_LEN,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Gcm => 16,
            CipherAlgorithm::Aes128Ctr => 0,
            CipherAlgorithm::Aes256Ctr => 0,
        }
    }

    /// Cipher block size used for padding.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// MAC algorithm for non-AEAD ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256, encrypt-then-MAC
    HmacSha256Etm,
    /// HMAC-SHA512, encrypt-then-MAC
    HmacSha512Etm,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Supported MACs in preference order.
    pub const ALL: [MacAlgorithm; 4] = [
        MacAlgorithm::HmacSha256Etm,
        MacAlgorithm::HmacSha512Etm,
        MacAlgorithm::HmacSha256,
        MacAlgorithm::HmacSha512,
    ];

    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256Etm => "hmac-sha2-256-etm@openssh.com",
            MacAlgorithm::HmacSha512Etm => "hmac-sha2-512-etm@openssh.com",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => 32,
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => 64,
        }
    }

    /// Whether the MAC covers the ciphertext instead of the plaintext.
    pub fn is_etm(&self) -> bool {
        matches!(self, MacAlgorithm::HmacSha256Etm | MacAlgorithm::HmacSha512Etm)
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }
}

/// MAC key for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> PiperResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(PiperError::Transport(format!(
                "insufficient key material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Computes `MAC(key, sequence_number || data)`.
    pub fn compute(&self, sequence: u32, data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC key size is valid");
                mac.update(&sequence.to_be_bytes());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(&self.key).expect("HMAC key size is valid");
                mac.update(&sequence.to_be_bytes());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, data: &[u8], received_mac: &[u8]) -> bool {
        let expected = self.compute(sequence, data);
        expected.len() == received_mac.len() && bool::from(expected.ct_eq(received_mac))
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Key material derived for one direction of a half-transport.
pub struct DirectionKeys {
    /// Negotiated cipher
    pub cipher: CipherAlgorithm,
    /// Negotiated MAC, `None` for AEAD ciphers
    pub mac: Option<MacAlgorithm>,
    /// Initial IV
    pub iv: Vec<u8>,
    /// Encryption key
    pub key: Vec<u8>,
    /// Integrity key
    pub mac_key: Vec<u8>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.key.zeroize();
        self.mac_key.zeroize();
    }
}

enum AesCtr {
    Aes128(Ctr128BE<Aes128>),
    Aes256(Ctr128BE<Aes256>),
}

impl AesCtr {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> PiperResult<Self> {
        let invalid = |_| PiperError::Transport(format!("bad key/iv for {}", algorithm.name()));
        match algorithm {
            CipherAlgorithm::Aes128Ctr => Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map(AesCtr::Aes128)
                .map_err(invalid),
            CipherAlgorithm::Aes256Ctr => Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map(AesCtr::Aes256)
                .map_err(invalid),
            other => Err(PiperError::Transport(format!(
                "{} is not a CTR cipher",
                other.name()
            ))),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            AesCtr::Aes128(c) => c.apply_keystream(buf),
            AesCtr::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

struct GcmKey {
    key: LessSafeKey,
    nonce: [u8; 12],
}

impl GcmKey {
    fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> PiperResult<Self> {
        let aead = match algorithm {
            CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
            CipherAlgorithm::Aes256Gcm => &AES_256_GCM,
            other => {
                return Err(PiperError::Transport(format!(
                    "{} is not a GCM cipher",
                    other.name()
                )))
            }
        };
        let unbound = UnboundKey::new(aead, key)
            .map_err(|_| PiperError::Transport(format!("bad key for {}", algorithm.name())))?;
        let nonce: [u8; 12] = iv
            .try_into()
            .map_err(|_| PiperError::Transport("GCM IV must be 12 bytes".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce,
        })
    }

    /// Nonce for the current packet; the 64-bit invocation counter in the
    /// low 8 bytes is incremented afterwards.
    fn next_nonce(&mut self) -> Nonce {
        let current = Nonce::assume_unique_for_key(self.nonce);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.nonce[4..]);
        let next = u64::from_be_bytes(counter).wrapping_add(1);
        self.nonce[4..].copy_from_slice(&next.to_be_bytes());
        current
    }
}

fn chacha_key(key: &[u8]) -> PiperResult<&[u8; chacha::KEY_LEN]> {
    key.try_into().map_err(|_| {
        PiperError::Transport(format!(
            "chacha20-poly1305 needs {} bytes of key material",
            chacha::KEY_LEN
        ))
    })
}

enum SealState {
    Plain,
    ChaCha(Box<chacha::SealingKey>),
    Gcm(GcmKey),
    Ctr { cipher: AesCtr, mac: MacKey },
}

/// Outbound packet protection for one half-transport.
pub struct PacketSealer {
    state: SealState,
    block_size: usize,
}

impl std::fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSealer")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl PacketSealer {
    /// Sealer used before the first NEWKEYS.
    pub fn plain() -> Self {
        Self {
            state: SealState::Plain,
            block_size: PLAIN_BLOCK_SIZE,
        }
    }

    /// Builds a sealer from freshly derived keys.
    pub fn new(keys: &DirectionKeys) -> PiperResult<Self> {
        let state = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                SealState::ChaCha(Box::new(chacha::SealingKey::new(chacha_key(&keys.key)?)))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                SealState::Gcm(GcmKey::new(keys.cipher, &keys.key, &keys.iv)?)
            }
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = keys.mac.ok_or_else(|| {
                    PiperError::Transport(format!("{} requires a MAC", keys.cipher.name()))
                })?;
                SealState::Ctr {
                    cipher: AesCtr::new(keys.cipher, &keys.key, &keys.iv)?,
                    mac: MacKey::new(mac, &keys.mac_key)?,
                }
            }
        };
        Ok(Self {
            state,
            block_size: keys.cipher.block_size(),
        })
    }

    fn length_excluded(&self) -> bool {
        match &self.state {
            SealState::Plain => false,
            SealState::Ctr { mac, .. } => mac.algorithm().is_etm(),
            SealState::ChaCha(_) | SealState::Gcm(_) => true,
        }
    }

    /// Frames, pads and protects one payload, returning the wire bytes.
    pub fn seal(&mut self, sequence: u32, payload: &[u8]) -> PiperResult<Vec<u8>> {
        let packet = Packet::new(payload.to_vec(), self.block_size, self.length_excluded());
        let mut buf = packet.to_bytes();

        match &mut self.state {
            SealState::Plain => {}
            SealState::ChaCha(key) => {
                let mut tag = [0u8; chacha::TAG_LEN];
                key.seal_in_place(sequence, &mut buf, &mut tag);
                buf.extend_from_slice(&tag);
            }
            SealState::Gcm(gcm) => {
                let nonce = gcm.next_nonce();
                let (length, body) = buf.split_at_mut(4);
                let aad = [length[0], length[1], length[2], length[3]];
                let tag = gcm
                    .key
                    .seal_in_place_separate_tag(nonce, Aad::from(aad), body)
                    .map_err(|_| PiperError::Transport("GCM seal failed".to_string()))?;
                buf.extend_from_slice(tag.as_ref());
            }
            SealState::Ctr { cipher, mac } => {
                if mac.algorithm().is_etm() {
                    cipher.apply(&mut buf[4..]);
                    let tag = mac.compute(sequence, &buf);
                    buf.extend_from_slice(&tag);
                } else {
                    let tag = mac.compute(sequence, &buf);
                    cipher.apply(&mut buf);
                    buf.extend_from_slice(&tag);
                }
            }
        }

        Ok(buf)
    }
}

enum OpenState {
    Plain,
    ChaCha(Box<chacha::OpeningKey>),
    Gcm(GcmKey),
    Ctr { cipher: AesCtr, mac: MacKey },
}

/// Inbound packet verification and decryption for one half-transport.
///
/// Reading a packet is a three step affair, because the length is only
/// known after the first bytes arrive:
/// 1. read [`header_len`](Self::header_len) bytes and call
///    [`packet_length`](Self::packet_length),
/// 2. read [`remaining_len`](Self::remaining_len) more bytes,
/// 3. call [`open`](Self::open) on the whole buffer.
pub struct PacketOpener {
    state: OpenState,
    block_size: usize,
}

impl std::fmt::Debug for PacketOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketOpener")
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl PacketOpener {
    /// Opener used before the first NEWKEYS.
    pub fn plain() -> Self {
        Self {
            state: OpenState::Plain,
            block_size: PLAIN_BLOCK_SIZE,
        }
    }

    /// Builds an opener from freshly derived keys.
    pub fn new(keys: &DirectionKeys) -> PiperResult<Self> {
        let state = match keys.cipher {
            CipherAlgorithm::ChaCha20Poly1305 => {
                OpenState::ChaCha(Box::new(chacha::OpeningKey::new(chacha_key(&keys.key)?)))
            }
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                OpenState::Gcm(GcmKey::new(keys.cipher, &keys.key, &keys.iv)?)
            }
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => {
                let mac = keys.mac.ok_or_else(|| {
                    PiperError::Transport(format!("{} requires a MAC", keys.cipher.name()))
                })?;
                OpenState::Ctr {
                    cipher: AesCtr::new(keys.cipher, &keys.key, &keys.iv)?,
                    mac: MacKey::new(mac, &keys.mac_key)?,
                }
            }
        };
        Ok(Self {
            state,
            block_size: keys.cipher.block_size(),
        })
    }

    fn length_encrypted_with_body(&self) -> bool {
        match &self.state {
            OpenState::Plain => true,
            OpenState::Ctr { mac, .. } => !mac.algorithm().is_etm(),
            OpenState::ChaCha(_) | OpenState::Gcm(_) => false,
        }
    }

    /// Bytes that must be read before the packet length is known.
    pub fn header_len(&self) -> usize {
        match &self.state {
            OpenState::Ctr { mac, .. } if !mac.algorithm().is_etm() => self.block_size,
            _ => 4,
        }
    }

    /// Length of the MAC or tag following the packet.
    pub fn trailer_len(&self) -> usize {
        match &self.state {
            OpenState::Plain => 0,
            OpenState::ChaCha(_) => chacha::TAG_LEN,
            OpenState::Gcm(_) => 16,
            OpenState::Ctr { mac, .. } => mac.algorithm().mac_size(),
        }
    }

    /// Decodes and validates the packet length from the first
    /// [`header_len`](Self::header_len) bytes.
    ///
    /// For encrypt-and-MAC CTR the header block is decrypted in place.
    pub fn packet_length(&mut self, sequence: u32, header: &mut [u8]) -> PiperResult<usize> {
        if header.len() != self.header_len() {
            return Err(PiperError::Transport("short packet header".to_string()));
        }

        let length_bytes = match &mut self.state {
            OpenState::ChaCha(key) => {
                key.decrypt_packet_length(sequence, [header[0], header[1], header[2], header[3]])
            }
            OpenState::Ctr { cipher, mac } if !mac.algorithm().is_etm() => {
                cipher.apply(header);
                [header[0], header[1], header[2], header[3]]
            }
            _ => [header[0], header[1], header[2], header[3]],
        };

        let packet_length = u32::from_be_bytes(length_bytes) as usize;
        check_packet_length(packet_length)?;

        let aligned = if self.length_encrypted_with_body() {
            4 + packet_length
        } else {
            packet_length
        };
        if aligned % self.block_size != 0 {
            return Err(PiperError::Transport(format!(
                "packet length {} not aligned to block size {}",
                packet_length, self.block_size
            )));
        }

        Ok(packet_length)
    }

    /// Bytes still to read after the header for a packet of `packet_length`.
    pub fn remaining_len(&self, packet_length: usize) -> usize {
        4 + packet_length + self.trailer_len() - self.header_len()
    }

    /// Authenticates and decrypts a complete packet, returning its payload.
    ///
    /// `wire` holds the header (as passed to `packet_length`) followed by the
    /// remaining bytes.
    pub fn open(
        &mut self,
        sequence: u32,
        wire: &mut [u8],
        packet_length: usize,
    ) -> PiperResult<Vec<u8>> {
        let end = 4 + packet_length;
        if wire.len() != end + self.trailer_len() {
            return Err(PiperError::Transport("incomplete packet".to_string()));
        }
        let bad_mac = || PiperError::Transport("MAC verification failed".to_string());
        let header_len = self.header_len();

        let body: &[u8] = match &mut self.state {
            OpenState::Plain => &wire[4..end],
            OpenState::ChaCha(key) => {
                let (packet, tag) = wire.split_at_mut(end);
                let tag: &[u8; chacha::TAG_LEN] = (&*tag).try_into().map_err(|_| bad_mac())?;
                key.open_in_place(sequence, packet, tag).map_err(|_| bad_mac())?
            }
            OpenState::Gcm(gcm) => {
                let nonce = gcm.next_nonce();
                let (length, rest) = wire.split_at_mut(4);
                let aad = [length[0], length[1], length[2], length[3]];
                let plain = gcm
                    .key
                    .open_in_place(nonce, Aad::from(aad), rest)
                    .map_err(|_| bad_mac())?;
                &*plain
            }
            OpenState::Ctr { cipher, mac } => {
                let (packet, received) = wire.split_at_mut(end);
                if mac.algorithm().is_etm() {
                    if !mac.verify(sequence, packet, received) {
                        return Err(bad_mac());
                    }
                    cipher.apply(&mut packet[4..]);
                } else {
                    cipher.apply(&mut packet[header_len..]);
                    if !mac.verify(sequence, packet, received) {
                        return Err(bad_mac());
                    }
                }
                &packet[4..]
            }
        };

        Ok(Packet::from_body(body)?.into_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> DirectionKeys {
        DirectionKeys {
            cipher,
            mac,
            iv: (0..cipher.iv_size() as u8).collect(),
            key: (0..cipher.key_size() as u8).map(|b| b.wrapping_mul(7)).collect(),
            mac_key: vec![0x42; mac.map_or(0, |m| m.key_size())],
        }
    }

    fn open_wire(opener: &mut PacketOpener, sequence: u32, wire: &[u8]) -> PiperResult<Vec<u8>> {
        let mut buf = wire.to_vec();
        let header_len = opener.header_len();
        let packet_length = opener.packet_length(sequence, &mut buf[..header_len])?;
        assert_eq!(header_len + opener.remaining_len(packet_length), buf.len());
        opener.open(sequence, &mut buf, packet_length)
    }

    fn all_suites() -> Vec<(CipherAlgorithm, Option<MacAlgorithm>)> {
        let mut suites = vec![
            (CipherAlgorithm::ChaCha20Poly1305, None),
            (CipherAlgorithm::Aes128Gcm, None),
            (CipherAlgorithm::Aes256Gcm, None),
        ];
        for cipher in [CipherAlgorithm::Aes128Ctr, CipherAlgorithm::Aes256Ctr] {
            for mac in MacAlgorithm::ALL {
                suites.push((cipher, Some(mac)));
            }
        }
        suites
    }

    #[test]
    fn test_cipher_algorithm_properties() {
        let chacha = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chacha.name(), "chacha20-poly1305@openssh.com");
        assert_eq!(chacha.key_size(), 64);
        assert_eq!(chacha.iv_size(), 0);
        assert_eq!(chacha.tag_size(), 16);
        assert_eq!(chacha.block_size(), 8);
        assert!(chacha.is_aead());

        let aes128 = CipherAlgorithm::Aes128Gcm;
        assert_eq!(aes128.key_size(), 16);
        assert_eq!(aes128.iv_size(), 12);
        assert!(aes128.is_aead());

        let aes256_ctr = CipherAlgorithm::Aes256Ctr;
        assert_eq!(aes256_ctr.key_size(), 32);
        assert_eq!(aes256_ctr.block_size(), 16);
        assert!(!aes256_ctr.is_aead());
    }

    #[test]
    fn test_names_round_trip() {
        for cipher in CipherAlgorithm::ALL {
            assert_eq!(CipherAlgorithm::from_name(cipher.name()), Some(cipher));
        }
        for mac in MacAlgorithm::ALL {
            assert_eq!(MacAlgorithm::from_name(mac.name()), Some(mac));
        }
        assert!(CipherAlgorithm::from_name("3des-cbc").is_none());
        assert!(MacAlgorithm::from_name("hmac-md5").is_none());
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = MacKey::new(MacAlgorithm::HmacSha256, &[7u8; 32]).unwrap();
        let mac = key.compute(3, b"packet");
        assert_eq!(mac.len(), 32);
        assert!(key.verify(3, b"packet", &mac));
        assert!(!key.verify(4, b"packet", &mac));
        assert!(!key.verify(3, b"packet", &mac[..31]));
    }

    #[test]
    fn test_mac_key_too_short() {
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_seal_open_every_suite() {
        for (cipher, mac) in all_suites() {
            let k = keys(cipher, mac);
            let mut sealer = PacketSealer::new(&k).unwrap();
            let mut opener = PacketOpener::new(&k).unwrap();

            for (seq, payload) in [b"\x05hello".to_vec(), vec![94u8; 1000], vec![2u8]]
                .into_iter()
                .enumerate()
            {
                let wire = sealer.seal(seq as u32, &payload).unwrap();
                let opened = open_wire(&mut opener, seq as u32, &wire).unwrap();
                assert_eq!(opened, payload, "{} {:?}", cipher.name(), mac);
            }
        }
    }

    #[test]
    fn test_ciphertext_hides_payload() {
        let k = keys(CipherAlgorithm::Aes128Gcm, None);
        let mut sealer = PacketSealer::new(&k).unwrap();
        let secret = b"\x32password-in-clear".to_vec();
        let wire = sealer.seal(0, &secret).unwrap();
        assert!(!wire.windows(8).any(|w| w == b"password"));
    }

    #[test]
    fn test_tamper_detected() {
        for (cipher, mac) in all_suites() {
            let k = keys(cipher, mac);
            let mut sealer = PacketSealer::new(&k).unwrap();
            let mut opener = PacketOpener::new(&k).unwrap();

            let mut wire = sealer.seal(9, b"\x5edata").unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 0x01;
            assert!(
                open_wire(&mut opener, 9, &wire).is_err(),
                "{} {:?}",
                cipher.name(),
                mac
            );
        }
    }

    #[test]
    fn test_wrong_sequence_rejected() {
        let k = keys(CipherAlgorithm::ChaCha20Poly1305, None);
        let mut sealer = PacketSealer::new(&k).unwrap();
        let mut opener = PacketOpener::new(&k).unwrap();
        let wire = sealer.seal(1, b"\x5edata").unwrap();
        assert!(open_wire(&mut opener, 2, &wire).is_err());
    }

    #[test]
    fn test_plain_framing() {
        let mut sealer = PacketSealer::plain();
        let mut opener = PacketOpener::plain();
        let wire = sealer.seal(0, b"\x14kexinit").unwrap();
        assert_eq!(wire.len() % 8, 0);
        assert_eq!(open_wire(&mut opener, 0, &wire).unwrap(), b"\x14kexinit");
    }

    #[test]
    fn test_gcm_nonce_counter() {
        let k = keys(CipherAlgorithm::Aes256Gcm, None);
        let mut gcm = GcmKey::new(k.cipher, &k.key, &k.iv).unwrap();
        let first = gcm.nonce;
        gcm.next_nonce();
        assert_eq!(gcm.nonce[..4], first[..4]);
        assert_eq!(
            u64::from_be_bytes(gcm.nonce[4..].try_into().unwrap()),
            u64::from_be_bytes(first[4..].try_into().unwrap()) + 1
        );
    }
}
