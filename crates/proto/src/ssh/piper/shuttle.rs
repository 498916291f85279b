//! Post-authentication packet forwarding.
//!
//! Two pump tasks copy whole packets, one per direction, through that
//! direction's [`HookChain`]. The first pump to finish cancels a shared
//! token; its result is the pipe's result and whatever the other pump
//! returns afterwards is only logged at debug level.

use super::hook::{HookAction, HookChain};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::transport::{HalfTransport, TransportReader, TransportWriter};
use piper_platform::{PiperError, PiperResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Direction of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend
    DownstreamToUpstream,
    /// Backend to client
    UpstreamToDownstream,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::DownstreamToUpstream => "downstream->upstream",
            Direction::UpstreamToDownstream => "upstream->downstream",
        }
    }
}

/// The forwarding phase of one pipe.
pub struct Shuttle {
    downstream: HalfTransport,
    upstream: HalfTransport,
    downstream_hooks: HookChain,
    upstream_hooks: HookChain,
}

impl Shuttle {
    /// Shuttle between two authenticated halves, with no hooks.
    pub fn new(downstream: HalfTransport, upstream: HalfTransport) -> Self {
        Self {
            downstream,
            upstream,
            downstream_hooks: HookChain::new(),
            upstream_hooks: HookChain::new(),
        }
    }

    /// Sets the hook chains.
    ///
    /// # Arguments
    ///
    /// * `downstream_hooks` - run on packets read from the downstream
    /// * `upstream_hooks` - run on packets read from the upstream
    pub fn with_hooks(mut self, downstream_hooks: HookChain, upstream_hooks: HookChain) -> Self {
        self.downstream_hooks = downstream_hooks;
        self.upstream_hooks = upstream_hooks;
        self
    }

    /// Forwards packets until either side closes, errors, or `token` is
    /// cancelled, then closes both write sides.
    ///
    /// A peer's DISCONNECT is forwarded before the pipe ends. When `token`
    /// was cancelled from outside, both peers get a `by_application`
    /// DISCONNECT.
    ///
    /// # Errors
    ///
    /// The error of the first pump to fail. End of stream is not an error.
    pub async fn run(self, token: CancellationToken) -> PiperResult<()> {
        let (downstream_reader, downstream_writer) = self.downstream.split();
        let (upstream_reader, upstream_writer) = self.upstream.split();

        let mut outbound = tokio::spawn(pump(
            Direction::DownstreamToUpstream,
            downstream_reader,
            downstream_writer.clone(),
            upstream_writer.clone(),
            self.downstream_hooks,
            token.clone(),
        ));
        let mut inbound = tokio::spawn(pump(
            Direction::UpstreamToDownstream,
            upstream_reader,
            upstream_writer.clone(),
            downstream_writer.clone(),
            self.upstream_hooks,
            token.clone(),
        ));

        let (first, rest): (_, JoinHandle<PiperResult<()>>) = tokio::select! {
            result = &mut outbound => (result, inbound),
            result = &mut inbound => (result, outbound),
        };
        let shutting_down = token.is_cancelled();
        token.cancel();

        let result = first.unwrap_or_else(|e| Err(PiperError::Other(Box::new(e))));
        match rest.await {
            Ok(Err(e)) => debug!(error = %e, "dropping second shuttle error"),
            Err(e) => debug!(error = %e, "second pump did not finish cleanly"),
            Ok(Ok(())) => {}
        }

        for (side, writer) in [("downstream", &downstream_writer), ("upstream", &upstream_writer)] {
            let closed = if shutting_down {
                writer
                    .disconnect(DisconnectReason::ByApplication, "proxy shutting down")
                    .await
            } else {
                writer.shutdown().await
            };
            if let Err(e) = closed {
                debug!(side, error = %e, "could not close half");
            }
        }
        result
    }
}

async fn pump(
    direction: Direction,
    mut source: TransportReader,
    source_writer: TransportWriter,
    destination: TransportWriter,
    hooks: HookChain,
    token: CancellationToken,
) -> PiperResult<()> {
    let direction = direction.as_str();
    loop {
        let packet = tokio::select! {
            _ = token.cancelled() => {
                trace!(direction, "pump cancelled");
                return Ok(());
            }
            packet = source.read_packet() => match packet {
                Ok(packet) => packet,
                Err(e) if e.is_eof() => {
                    debug!(direction, packets = source.sequence(), "source closed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        match hooks.run(packet)? {
            HookAction::Transform(packet) => {
                let disconnect = packet.first() == Some(&(MessageType::Disconnect as u8));
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    written = destination.write_packet(&packet) => written?,
                }
                if disconnect {
                    debug!(direction, "disconnect forwarded");
                    return Ok(());
                }
            }
            HookAction::Reply(reply) => {
                let kind = reply.first().copied().unwrap_or_default();
                trace!(direction, kind, "hook replied");
                source_writer.write_packet(&reply).await?;
            }
            HookAction::Drop => trace!(direction, "hook dropped packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::hook::{PacketHook, ReplyPing};
    use crate::ssh::hostkey::PublicKey;
    use crate::ssh::message::Disconnect;
    use crate::ssh::privatekey::PrivateKey;
    use crate::ssh::transport::HostKeyVerifier;
    use crate::ssh::version::Version;
    use std::sync::Arc;
    use std::time::Duration;

    struct AnyKey;

    #[async_trait::async_trait]
    impl HostKeyVerifier for AnyKey {
        async fn verify(&mut self, _key: &PublicKey, _blob: &[u8]) -> PiperResult<()> {
            Ok(())
        }
    }

    /// Returns (server half, client half) over an in-memory stream.
    async fn pair() -> (HalfTransport, HalfTransport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let keys = Arc::new(vec![PrivateKey::generate_ed25519()]);
        let server = HalfTransport::handshake_noauth_server(a, Version::new("Proxy", None), keys);
        let client = async move {
            let version = Version::new("Client", None);
            HalfTransport::handshake_noauth_client(b, version, &mut AnyKey).await
        };
        let (server, client) = tokio::join!(server, client);
        (server.unwrap(), client.unwrap())
    }

    /// Client, upstream server, and a shuttle between them.
    async fn setup() -> (HalfTransport, HalfTransport, Shuttle) {
        let (proxy_down, client) = pair().await;
        let (upstream, proxy_up) = pair().await;
        (client, upstream, Shuttle::new(proxy_down, proxy_up))
    }

    struct Fails;

    impl PacketHook for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn handle(&self, _packet: Vec<u8>) -> PiperResult<HookAction> {
            Err(PiperError::Protocol("refused by hook".to_string()))
        }
    }

    #[tokio::test]
    async fn test_forwards_both_ways() {
        let (mut client, mut upstream, shuttle) = setup().await;
        let token = CancellationToken::new();
        let task = tokio::spawn(shuttle.run(token.clone()));

        client.write_packet(&[94, 0, 0, 0, 0, 1, 2]).await.unwrap();
        assert_eq!(upstream.read_packet().await.unwrap(), vec![94, 0, 0, 0, 0, 1, 2]);
        upstream.write_packet(&[94, 0, 0, 0, 0, 3]).await.unwrap();
        assert_eq!(client.read_packet().await.unwrap(), vec![94, 0, 0, 0, 0, 3]);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reply_goes_back_to_source() {
        let (mut client, mut upstream, shuttle) = setup().await;
        let pings = HookChain::new().with(Arc::new(ReplyPing));
        let shuttle = shuttle.with_hooks(pings, HookChain::new());
        let token = CancellationToken::new();
        let task = tokio::spawn(shuttle.run(token.clone()));

        let mut ping = vec![MessageType::Ping as u8];
        crate::ssh::wire::write_str(&mut ping, "keepalive");
        client.write_packet(&ping).await.unwrap();
        let pong = client.read_packet().await.unwrap();
        assert_eq!(pong[0], MessageType::Pong as u8);
        assert_eq!(&pong[1..], &ping[1..]);

        // The upstream sees the next packet, not the ping
        client.write_packet(&[94, 9]).await.unwrap();
        assert_eq!(upstream.read_packet().await.unwrap(), vec![94, 9]);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upstream_close_ends_pipe() {
        let (mut client, upstream, shuttle) = setup().await;
        let task = tokio::spawn(shuttle.run(CancellationToken::new()));

        drop(upstream);
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap();
        result.unwrap().unwrap();
        assert!(client.read_packet().await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_forwarded_then_pipe_ends() {
        let (client, mut upstream, shuttle) = setup().await;
        let task = tokio::spawn(shuttle.run(CancellationToken::new()));

        client.disconnect(DisconnectReason::ByApplication, "done").await.unwrap();
        let payload = upstream.read_packet().await.unwrap();
        assert_eq!(Disconnect::from_bytes(&payload).unwrap().description, "done");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_disconnects_both_peers() {
        let (mut client, mut upstream, shuttle) = setup().await;
        let token = CancellationToken::new();
        let task = tokio::spawn(shuttle.run(token.clone()));

        token.cancel();
        task.await.unwrap().unwrap();
        for peer in [&mut client, &mut upstream] {
            let payload = peer.read_packet().await.unwrap();
            let disconnect = Disconnect::from_bytes(&payload).unwrap();
            assert_eq!(disconnect.reason, DisconnectReason::ByApplication);
        }
    }

    #[tokio::test]
    async fn test_hook_error_ends_pipe() {
        let (client, _upstream, shuttle) = setup().await;
        let shuttle = shuttle.with_hooks(HookChain::new().with(Arc::new(Fails)), HookChain::new());
        let task = tokio::spawn(shuttle.run(CancellationToken::new()));

        client.write_packet(&[94, 1]).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(PiperError::Protocol(_))));
    }
}
