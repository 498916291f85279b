//! SSH half-transport (RFC 4253).
//!
//! A [`HalfTransport`] is one complete transport-layer endpoint: one TCP
//! connection, one key exchange, one pair of cipher states. The proxy owns
//! two of them per pipe, one in each role:
//!
//! - **Server role** faces the downstream client. It presents every
//!   configured host key, lets the client pick, and accepts the
//!   `ssh-userauth` service request.
//! - **Client role** faces the upstream server. It verifies the upstream
//!   host key through a [`HostKeyVerifier`] and requests `ssh-userauth`.
//!
//! # Lifecycle
//!
//! 1. **Version exchange** - identification lines in both directions
//! 2. **Key exchange** - KEXINIT, ECDH/DH, NEWKEYS
//! 3. **Service** - `ssh-userauth` request and accept
//! 4. **Packets** - [`read_packet`](HalfTransport::read_packet) and
//!    [`write_packet`](HalfTransport::write_packet) until one side closes
//!
//! # Re-keying
//!
//! A KEXINIT from the peer is handled inside `read_packet`: the reader takes
//! the write lock, runs the exchange and installs the new keys before
//! returning the next non-KEX packet. Sequence numbers and the session ID
//! are never reset. On re-key the client role requires the upstream host key
//! from the first exchange.

use super::auth::SERVICE_USERAUTH;
use super::crypto::{PacketOpener, PacketSealer};
use super::hostkey::PublicKey;
use super::kex::{guess_was_right, negotiate, KexInit, Negotiated, EXT_INFO_CLIENT};
use super::kex_dh::{
    derive_direction_keys, exchange_hash, Direction, EphemeralKex, ExchangeHashInput,
};
use super::message::{
    message_name, parse_service_message, service_message, Disconnect, DisconnectReason,
    MessageType,
};
use super::privatekey::PrivateKey;
use super::version::{read_identification, write_identification, Version};
use super::wire::{
    read_mpint, read_string, write_mpint, write_name_list, write_str, write_string, write_u32,
    write_u8,
};
use async_trait::async_trait;
use piper_platform::{PiperError, PiperResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Signature algorithms the server role accepts for user authentication,
/// advertised in `server-sig-algs`.
pub const USER_SIGNATURE_ALGORITHMS: [&str; 7] = [
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ssh-rsa",
];

type BoxedRead = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Which end of the SSH connection a half-transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Downstream-facing; we are the SSH server.
    Server,
    /// Upstream-facing; we are the SSH client.
    Client,
}

/// Decides whether an upstream host key is acceptable.
///
/// Called once during the client role's first key exchange, after the
/// exchange-hash signature has been verified and before NEWKEYS is sent.
#[async_trait]
pub trait HostKeyVerifier: Send {
    /// Returns `Ok(())` to accept `key` (whose wire encoding is `blob`).
    async fn verify(&mut self, key: &PublicKey, blob: &[u8]) -> PiperResult<()>;
}

/// Connection-wide parameters, frozen after the first key exchange.
struct KexParams {
    role: Role,
    local_version: Version,
    peer_version: Version,
    host_keys: Arc<Vec<PrivateKey>>,
    session_id: Vec<u8>,
    server_host_key: Vec<u8>,
}

impl KexParams {
    fn versions(&self) -> (&Version, &Version) {
        match self.role {
            Role::Server => (&self.peer_version, &self.local_version),
            Role::Client => (&self.local_version, &self.peer_version),
        }
    }

    fn local_kexinit(&self) -> KexInit {
        match self.role {
            Role::Client => KexInit::for_client(),
            Role::Server => {
                let mut algorithms: Vec<String> = Vec::new();
                for key in self.host_keys.iter() {
                    for alg in key.signature_algorithms() {
                        if !algorithms.iter().any(|a| a == alg) {
                            algorithms.push(alg.to_string());
                        }
                    }
                }
                KexInit::for_server(algorithms)
            }
        }
    }
}

struct PacketReader {
    stream: BufReader<BoxedRead>,
    opener: PacketOpener,
    sequence: u64,
}

impl PacketReader {
    fn new(stream: BoxedRead) -> Self {
        Self {
            stream: BufReader::new(stream),
            opener: PacketOpener::plain(),
            sequence: 0,
        }
    }

    async fn read_payload(&mut self) -> PiperResult<Vec<u8>> {
        // wire sequence numbers wrap at 2^32
        let sequence = self.sequence as u32;
        let header_len = self.opener.header_len();
        let mut wire = vec![0u8; header_len];
        self.stream.read_exact(&mut wire).await?;

        let packet_length = self.opener.packet_length(sequence, &mut wire)?;
        let remaining = self.opener.remaining_len(packet_length);
        wire.resize(header_len + remaining, 0);
        self.stream.read_exact(&mut wire[header_len..]).await?;

        let payload = self.opener.open(sequence, &mut wire, packet_length)?;
        self.sequence = self.sequence.wrapping_add(1);
        if payload.is_empty() {
            return Err(PiperError::Protocol("empty packet payload".to_string()));
        }
        trace!(sequence, message = %message_name(payload[0]), "packet received");
        Ok(payload)
    }
}

struct PacketWriter {
    stream: BoxedWrite,
    sealer: PacketSealer,
    sequence: u64,
}

impl PacketWriter {
    fn new(stream: BoxedWrite) -> Self {
        Self {
            stream,
            sealer: PacketSealer::plain(),
            sequence: 0,
        }
    }

    async fn write_payload(&mut self, payload: &[u8]) -> PiperResult<()> {
        let sequence = self.sequence as u32;
        let wire = self.sealer.seal(sequence, payload)?;
        self.sequence = self.sequence.wrapping_add(1);
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        trace!(sequence, message = %message_name(payload[0]), "packet sent");
        Ok(())
    }
}

struct KexOutcome {
    exchange_hash: Vec<u8>,
    host_key: Vec<u8>,
    peer_wants_ext_info: bool,
}

/// Reads the next key-exchange message, skipping IGNORE and DEBUG.
async fn read_kex_message(
    reader: &mut PacketReader,
    expected: MessageType,
) -> PiperResult<Vec<u8>> {
    loop {
        let payload = reader.read_payload().await?;
        match payload[0] {
            k if k == expected as u8 => return Ok(payload),
            k if k == MessageType::Ignore as u8 || k == MessageType::Debug as u8 => continue,
            k if k == MessageType::Disconnect as u8 => {
                return Err(Disconnect::from_bytes(&payload)?.into_error())
            }
            other => {
                return Err(PiperError::Protocol(format!(
                    "expected {} during key exchange, got {}",
                    expected,
                    message_name(other)
                )))
            }
        }
    }
}

/// Runs one complete key exchange.
///
/// `peer_kexinit` is the KEXINIT payload that triggered a re-key, if any.
/// `verifier` is only consulted by the client role on the first exchange.
async fn key_exchange(
    reader: &mut PacketReader,
    writer: &mut PacketWriter,
    params: &KexParams,
    peer_kexinit: Option<Vec<u8>>,
    verifier: Option<&mut dyn HostKeyVerifier>,
) -> PiperResult<KexOutcome> {
    let local = params.local_kexinit();
    let local_payload = local.to_bytes();
    writer.write_payload(&local_payload).await?;

    let peer_payload = match peer_kexinit {
        Some(payload) => payload,
        None => read_kex_message(reader, MessageType::KexInit).await?,
    };
    let peer = KexInit::from_bytes(&peer_payload)?;

    let (client_init, server_init, client_payload, server_payload) = match params.role {
        Role::Client => (&local, &peer, &local_payload, &peer_payload),
        Role::Server => (&peer, &local, &peer_payload, &local_payload),
    };
    let negotiated = negotiate(client_init, server_init)?;
    debug!(
        role = ?params.role,
        kex = ?negotiated.kex,
        host_key = %negotiated.host_key,
        cipher_c2s = negotiated.cipher_client_to_server.name(),
        cipher_s2c = negotiated.cipher_server_to_client.name(),
        "algorithms negotiated"
    );

    if peer.first_kex_packet_follows() && !guess_was_right(client_init, server_init) {
        let discarded = reader.read_payload().await?;
        debug!(message = %message_name(discarded[0]), "discarded wrongly guessed kex packet");
    }

    let ephemeral = EphemeralKex::new(negotiated.kex)?;
    let local_public = ephemeral.public_value();
    let uses_mpint = ephemeral.uses_mpint();
    let (client_version, server_version) = params.versions();

    let (exchange_hash, host_key, shared_secret) = match params.role {
        Role::Client => {
            let mut init = Vec::with_capacity(local_public.len() + 8);
            write_u8(&mut init, MessageType::KexdhInit as u8);
            if uses_mpint {
                write_mpint(&mut init, &local_public);
            } else {
                write_string(&mut init, &local_public);
            }
            writer.write_payload(&init).await?;

            let reply = read_kex_message(reader, MessageType::KexdhReply).await?;
            let mut offset = 1;
            let host_key_blob = read_string(&reply, &mut offset)?.to_vec();
            let server_public = if uses_mpint {
                read_mpint(&reply, &mut offset)?.to_vec()
            } else {
                read_string(&reply, &mut offset)?.to_vec()
            };
            let signature = read_string(&reply, &mut offset)?.to_vec();

            let shared_secret = ephemeral.agree(&server_public)?;
            let hash = exchange_hash(
                negotiated.kex,
                &ExchangeHashInput {
                    client_version: client_version.as_bytes(),
                    server_version: server_version.as_bytes(),
                    client_kexinit: client_payload,
                    server_kexinit: server_payload,
                    host_key: &host_key_blob,
                    client_public: &local_public,
                    server_public: &server_public,
                    shared_secret: &shared_secret,
                },
            );

            let host_key = PublicKey::from_blob(&host_key_blob)
                .map_err(|e| PiperError::Handshake(format!("unusable host key: {}", e)))?;
            if !host_key.verify(&negotiated.host_key, &hash, &signature) {
                return Err(PiperError::Handshake(
                    "host key signature verification failed".to_string(),
                ));
            }

            match verifier {
                Some(verifier) => verifier.verify(&host_key, &host_key_blob).await?,
                None if host_key_blob != params.server_host_key => {
                    return Err(PiperError::Handshake(
                        "upstream host key changed during re-key".to_string(),
                    ))
                }
                None => {}
            }
            (hash, host_key_blob, shared_secret)
        }
        Role::Server => {
            let init = read_kex_message(reader, MessageType::KexdhInit).await?;
            let mut offset = 1;
            let client_public = if uses_mpint {
                read_mpint(&init, &mut offset)?.to_vec()
            } else {
                read_string(&init, &mut offset)?.to_vec()
            };

            let host_key = params
                .host_keys
                .iter()
                .find(|key| key.signature_algorithms().contains(&negotiated.host_key.as_str()))
                .ok_or_else(|| {
                    PiperError::Handshake(format!("no host key for {}", negotiated.host_key))
                })?;
            let host_key_blob = host_key.public_key().to_blob();

            let shared_secret = ephemeral.agree(&client_public)?;
            let hash = exchange_hash(
                negotiated.kex,
                &ExchangeHashInput {
                    client_version: client_version.as_bytes(),
                    server_version: server_version.as_bytes(),
                    client_kexinit: client_payload,
                    server_kexinit: server_payload,
                    host_key: &host_key_blob,
                    client_public: &client_public,
                    server_public: &local_public,
                    shared_secret: &shared_secret,
                },
            );
            let signature = host_key
                .sign(&negotiated.host_key, &hash)
                .map_err(|e| PiperError::Handshake(format!("host key signing failed: {}", e)))?;

            let mut reply = Vec::with_capacity(host_key_blob.len() + signature.len() + 64);
            write_u8(&mut reply, MessageType::KexdhReply as u8);
            write_string(&mut reply, &host_key_blob);
            if uses_mpint {
                write_mpint(&mut reply, &local_public);
            } else {
                write_string(&mut reply, &local_public);
            }
            write_string(&mut reply, &signature);
            writer.write_payload(&reply).await?;
            (hash, host_key_blob, shared_secret)
        }
    };

    let session_id = if params.session_id.is_empty() {
        &exchange_hash
    } else {
        &params.session_id
    };
    install_keys(
        reader,
        writer,
        params.role,
        &negotiated,
        &shared_secret,
        &exchange_hash,
        session_id,
    )
    .await?;

    Ok(KexOutcome {
        peer_wants_ext_info: params.role == Role::Server
            && peer.kex_algorithms().iter().any(|a| a == EXT_INFO_CLIENT),
        exchange_hash,
        host_key,
    })
}

async fn install_keys(
    reader: &mut PacketReader,
    writer: &mut PacketWriter,
    role: Role,
    negotiated: &Negotiated,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) -> PiperResult<()> {
    let client_to_server = derive_direction_keys(
        shared_secret,
        exchange_hash,
        session_id,
        Direction::ClientToServer,
        negotiated.cipher_client_to_server,
        negotiated.mac_client_to_server,
    );
    let server_to_client = derive_direction_keys(
        shared_secret,
        exchange_hash,
        session_id,
        Direction::ServerToClient,
        negotiated.cipher_server_to_client,
        negotiated.mac_server_to_client,
    );
    let (outbound, inbound) = match role {
        Role::Server => (server_to_client, client_to_server),
        Role::Client => (client_to_server, server_to_client),
    };

    writer.write_payload(&[MessageType::NewKeys as u8]).await?;
    writer.sealer = PacketSealer::new(&outbound)?;

    read_kex_message(reader, MessageType::NewKeys).await?;
    reader.opener = PacketOpener::new(&inbound)?;
    Ok(())
}

fn ext_info_message() -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    write_u8(&mut buf, MessageType::ExtInfo as u8);
    write_u32(&mut buf, 1);
    write_str(&mut buf, "server-sig-algs");
    write_name_list(&mut buf, &USER_SIGNATURE_ALGORITHMS);
    buf
}

/// Reads packets until one that is not IGNORE, DEBUG or (client role)
/// EXT_INFO arrives.
async fn read_service_message(
    reader: &mut PacketReader,
    expected: MessageType,
) -> PiperResult<Vec<u8>> {
    loop {
        let payload = reader.read_payload().await?;
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::Ignore) | Some(MessageType::Debug) | Some(MessageType::ExtInfo) => {}
            Some(MessageType::Disconnect) => {
                return Err(Disconnect::from_bytes(&payload)?.into_error())
            }
            Some(kind) if kind == expected => return Ok(payload),
            _ => {
                return Err(PiperError::Protocol(format!(
                    "expected {}, got {}",
                    expected,
                    message_name(payload[0])
                )))
            }
        }
    }
}

/// One SSH transport endpoint; see the [module documentation](self).
pub struct HalfTransport {
    reader: TransportReader,
    writer: TransportWriter,
}

impl std::fmt::Debug for HalfTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalfTransport")
            .field("role", &self.reader.params.role)
            .field("peer_version", &self.reader.params.peer_version.to_string())
            .finish_non_exhaustive()
    }
}

impl HalfTransport {
    /// Runs the downstream-facing handshake up to `ssh-userauth` service
    /// acceptance.
    ///
    /// Every key in `host_keys` is offered; the client picks the algorithm.
    ///
    /// # Errors
    ///
    /// [`PiperError::Handshake`] for version or negotiation failures,
    /// [`PiperError::Protocol`] if the client asks for another service.
    pub async fn handshake_noauth_server<S>(
        stream: S,
        identification: Version,
        host_keys: Arc<Vec<PrivateKey>>,
    ) -> PiperResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        if host_keys.is_empty() {
            return Err(PiperError::Config("no host keys configured".to_string()));
        }
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(Box::new(read_half));
        let mut writer = PacketWriter::new(Box::new(write_half));

        write_identification(&mut writer.stream, &identification).await?;
        let peer_version = read_identification(&mut reader.stream, false).await?;
        debug!(client = %peer_version, "client identification received");

        let mut params = KexParams {
            role: Role::Server,
            local_version: identification,
            peer_version,
            host_keys,
            session_id: Vec::new(),
            server_host_key: Vec::new(),
        };
        let outcome = key_exchange(&mut reader, &mut writer, &params, None, None).await?;
        params.session_id = outcome.exchange_hash;
        params.server_host_key = outcome.host_key;
        if outcome.peer_wants_ext_info {
            writer.write_payload(&ext_info_message()).await?;
        }

        let request = read_service_message(&mut reader, MessageType::ServiceRequest).await?;
        let service = parse_service_message(MessageType::ServiceRequest, &request)?;
        if service != SERVICE_USERAUTH {
            let refusal = Disconnect::new(
                DisconnectReason::ServiceNotAvailable,
                format!("service {} not available", service),
            );
            writer.write_payload(&refusal.to_bytes()).await?;
            return Err(PiperError::Protocol(format!(
                "client requested service {}",
                service
            )));
        }
        writer
            .write_payload(&service_message(MessageType::ServiceAccept, SERVICE_USERAUTH))
            .await?;

        Ok(Self::assemble(reader, writer, params))
    }

    /// Runs the upstream-facing handshake up to `ssh-userauth` service
    /// acceptance, consulting `verifier` for the upstream host key.
    ///
    /// # Errors
    ///
    /// [`PiperError::Handshake`] for version, negotiation or host key
    /// failures; whatever `verifier` returns when it rejects the key.
    pub async fn handshake_noauth_client<S>(
        stream: S,
        identification: Version,
        verifier: &mut dyn HostKeyVerifier,
    ) -> PiperResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(Box::new(read_half));
        let mut writer = PacketWriter::new(Box::new(write_half));

        write_identification(&mut writer.stream, &identification).await?;
        let peer_version = read_identification(&mut reader.stream, true).await?;
        debug!(server = %peer_version, "server identification received");

        let mut params = KexParams {
            role: Role::Client,
            local_version: identification,
            peer_version,
            host_keys: Arc::new(Vec::new()),
            session_id: Vec::new(),
            server_host_key: Vec::new(),
        };
        let outcome = key_exchange(&mut reader, &mut writer, &params, None, Some(verifier)).await?;
        params.session_id = outcome.exchange_hash;
        params.server_host_key = outcome.host_key;

        writer
            .write_payload(&service_message(MessageType::ServiceRequest, SERVICE_USERAUTH))
            .await?;
        let accept = read_service_message(&mut reader, MessageType::ServiceAccept).await?;
        let service = parse_service_message(MessageType::ServiceAccept, &accept)?;
        if service != SERVICE_USERAUTH {
            return Err(PiperError::Protocol(format!(
                "server accepted unexpected service {}",
                service
            )));
        }

        Ok(Self::assemble(reader, writer, params))
    }

    fn assemble(reader: PacketReader, writer: PacketWriter, params: KexParams) -> Self {
        let params = Arc::new(params);
        let writer = Arc::new(Mutex::new(writer));
        Self {
            reader: TransportReader {
                reader,
                writer: writer.clone(),
                params: params.clone(),
            },
            writer: TransportWriter { writer, params },
        }
    }

    /// Reads the next non-KEX packet payload; `payload[0]` is the message
    /// number.
    pub async fn read_packet(&mut self) -> PiperResult<Vec<u8>> {
        self.reader.read_packet().await
    }

    /// Encrypts and sends one packet payload.
    pub async fn write_packet(&self, payload: &[u8]) -> PiperResult<()> {
        self.writer.write_packet(payload).await
    }

    /// Session identifier from the first key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.reader.params.session_id
    }

    /// Identification line sent by the peer.
    pub fn peer_version(&self) -> &Version {
        &self.reader.params.peer_version
    }

    /// Which role this endpoint plays.
    pub fn role(&self) -> Role {
        self.reader.params.role
    }

    /// Host key blob used in the first key exchange: the upstream's key in
    /// the client role, ours in the server role.
    pub fn host_key(&self) -> &[u8] {
        &self.reader.params.server_host_key
    }

    /// Sends SSH_MSG_DISCONNECT and closes the write side.
    pub async fn disconnect(&self, reason: DisconnectReason, description: &str) -> PiperResult<()> {
        self.writer.disconnect(reason, description).await
    }

    /// Splits into independently usable read and write halves.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`HalfTransport`].
///
/// Keeps a handle on the write side so that a peer-initiated re-key can be
/// answered.
pub struct TransportReader {
    reader: PacketReader,
    writer: Arc<Mutex<PacketWriter>>,
    params: Arc<KexParams>,
}

impl TransportReader {
    /// Reads the next non-KEX packet payload, re-keying transparently.
    pub async fn read_packet(&mut self) -> PiperResult<Vec<u8>> {
        loop {
            let payload = self.reader.read_payload().await?;
            let kind = payload[0];
            if kind == MessageType::KexInit as u8 {
                debug!(role = ?self.params.role, "peer initiated re-key");
                let mut writer = self.writer.lock().await;
                key_exchange(&mut self.reader, &mut writer, &self.params, Some(payload), None)
                    .await?;
                continue;
            }
            if MessageType::is_kex(kind) {
                return Err(PiperError::Protocol(format!(
                    "{} outside key exchange",
                    message_name(kind)
                )));
            }
            return Ok(payload);
        }
    }

    /// Number of packets received so far.
    pub fn sequence(&self) -> u64 {
        self.reader.sequence
    }
}

/// Write half of a [`HalfTransport`]. Cloning shares the same cipher state.
#[derive(Clone)]
pub struct TransportWriter {
    writer: Arc<Mutex<PacketWriter>>,
    params: Arc<KexParams>,
}

impl TransportWriter {
    /// Encrypts and sends one packet payload.
    ///
    /// Key-exchange messages are refused; they are only ever produced by the
    /// transport itself.
    pub async fn write_packet(&self, payload: &[u8]) -> PiperResult<()> {
        match payload.first() {
            None => Err(PiperError::Protocol("refusing to send an empty packet".to_string())),
            Some(&kind) if MessageType::is_kex(kind) => Err(PiperError::Protocol(format!(
                "refusing to relay {}",
                message_name(kind)
            ))),
            Some(_) => self.writer.lock().await.write_payload(payload).await,
        }
    }

    /// Number of packets sent so far.
    pub async fn sequence(&self) -> u64 {
        self.writer.lock().await.sequence
    }

    /// Session identifier from the first key exchange.
    pub fn session_id(&self) -> &[u8] {
        &self.params.session_id
    }

    /// Sends SSH_MSG_DISCONNECT and closes the write side.
    pub async fn disconnect(&self, reason: DisconnectReason, description: &str) -> PiperResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_payload(&Disconnect::new(reason, description).to_bytes())
            .await?;
        writer.stream.shutdown().await?;
        Ok(())
    }

    /// Closes the write side without a DISCONNECT.
    pub async fn shutdown(&self) -> PiperResult<()> {
        self.writer.lock().await.stream.shutdown().await?;
        Ok(())
    }
}
