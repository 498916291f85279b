//! SSH transport pieces and the piping engine built on them.
//!
//! # Architecture
//!
//! 1. **Encoding** ([`wire`], [`message`], [`packet`]) - RFC 4251 data types,
//!    message numbers, the binary packet format
//! 2. **Transport** ([`version`], [`kex`], [`kex_dh`], [`crypto`],
//!    [`transport`]) - identification, key exchange and packet protection
//!    for one [`HalfTransport`] in either role (RFC 4253)
//! 3. **Keys** ([`hostkey`], [`privatekey`], [`certificate`],
//!    [`known_hosts`], [`authorized_keys`])
//! 4. **Authentication messages** ([`auth`]) - RFC 4252 and RFC 4256
//! 5. **Piping** ([`piper`]) - routing, auth bridging, shuttling
//!
//! The proxy never runs the connection protocol (RFC 4254) itself; after
//! authentication every packet is forwarded as-is.
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Auth
//! - [RFC 8308](https://datatracker.ietf.org/doc/html/rfc8308) - Extension Negotiation

pub mod auth;
pub mod authorized_keys;
pub mod certificate;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod piper;
pub mod privatekey;
pub mod transport;
pub mod version;
pub mod wire;

pub use auth::{
    construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk, AuthRequest,
    InfoRequest, InfoResponse, Prompt,
};
pub use authorized_keys::AuthorizedKeys;
pub use hostkey::PublicKey;
pub use known_hosts::{HostKeyStatus, KnownHosts};
pub use message::{Disconnect, DisconnectReason, MessageType};
pub use packet::Packet;
pub use privatekey::PrivateKey;
pub use transport::{HalfTransport, HostKeyVerifier, Role, TransportReader, TransportWriter};
pub use version::Version;
