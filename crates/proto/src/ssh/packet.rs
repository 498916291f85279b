//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac / authentication tag
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - `padding_length` is at least 4 bytes
//! - The padded region is a multiple of the cipher block size. For AEAD and
//!   encrypt-then-MAC modes the length field is excluded from that region.
//! - Packets larger than [`MAX_PACKET_SIZE`] are rejected
//!
//! This module only deals with plaintext framing; encryption of the framed
//! bytes lives in [`crate::ssh::crypto`].
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"\x05payload".to_vec(), 8, false);
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"\x05payload");
//! ```

use piper_platform::{PiperError, PiperResult};
use rand::RngCore;

/// Maximum packet length accepted from a peer.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Block size used before any cipher is negotiated.
pub const PLAIN_BLOCK_SIZE: usize = 8;

/// SSH binary packet in plaintext form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Frames a payload with random padding.
    ///
    /// `block_size` is the cipher block size (8 for plaintext and
    /// chacha20-poly1305, 16 for AES). When `length_excluded` is set, the
    /// 4-byte length field is not part of the aligned region, as required by
    /// AEAD and encrypt-then-MAC modes.
    pub fn new(payload: Vec<u8>, block_size: usize, length_excluded: bool) -> Self {
        let header = if length_excluded { 1 } else { 5 };
        let unpadded = header + payload.len();

        let mut padding_len = block_size - (unpadded % block_size);
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding length.
    pub fn padding_len(&self) -> usize {
        self.padding.len()
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes to `packet_length || padding_length || payload || padding`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.packet_length() + 64);
        buf.extend_from_slice(&(self.packet_length() as u32).to_be_bytes());
        buf.push(self.padding.len() as u8);
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.padding);
        buf
    }

    /// Parses an unencrypted packet including its length field.
    pub fn from_bytes(data: &[u8]) -> PiperResult<Self> {
        if data.len() < 4 {
            return Err(PiperError::Transport("packet shorter than header".to_string()));
        }
        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        check_packet_length(packet_length)?;
        if data.len() != 4 + packet_length {
            return Err(PiperError::Transport(format!(
                "packet length mismatch: header says {}, have {}",
                packet_length,
                data.len() - 4
            )));
        }
        Self::from_body(&data[4..])
    }

    /// Parses `padding_length || payload || padding`.
    pub fn from_body(body: &[u8]) -> PiperResult<Self> {
        let (&padding_len, rest) = body
            .split_first()
            .ok_or_else(|| PiperError::Transport("empty packet".to_string()))?;
        let padding_len = padding_len as usize;

        if padding_len < MIN_PADDING_LEN {
            return Err(PiperError::Transport(format!(
                "padding too short: {}",
                padding_len
            )));
        }
        if padding_len >= rest.len() {
            return Err(PiperError::Transport(format!(
                "padding {} leaves no payload in {} bytes",
                padding_len,
                rest.len()
            )));
        }

        let split = rest.len() - padding_len;
        Ok(Self {
            payload: rest[..split].to_vec(),
            padding: rest[split..].to_vec(),
        })
    }
}

/// Validates a `packet_length` field read from the wire.
pub fn check_packet_length(packet_length: usize) -> PiperResult<()> {
    if packet_length < 1 + MIN_PADDING_LEN + 1 {
        return Err(PiperError::Transport(format!(
            "packet too small: {} bytes",
            packet_length
        )));
    }
    if packet_length > MAX_PACKET_SIZE {
        return Err(PiperError::Transport(format!(
            "packet too large: {} bytes (max {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    Ok(())
}
