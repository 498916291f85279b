//! Per-connection orchestration.
//!
//! The [`Supervisor`] accepts downstream connections and runs each one as an
//! isolated pipe task:
//!
//! 1. Optional PROXY header
//! 2. Downstream handshake, first auth request, router context
//! 3. Auth bridge, dialing the upstream on the first decision that needs it
//! 4. Shuttle until either side goes away
//! 5. Teardown and [`Router::on_pipe_close`]
//!
//! Steps 1 to 3 run under the login grace time. A failing pipe is logged and
//! never affects the listener or other pipes.

use super::bridge::{read_auth_request, AuthBridge, BridgeOutcome, UpstreamConnector};
use super::hook::HookChain;
use super::proxy_protocol::{resolve_remote_addr, ProxyProtocolConfig};
use super::router::{ConnectionMeta, Router, Upstream};
use super::shuttle::Shuttle;
use crate::ssh::message::DisconnectReason;
use crate::ssh::privatekey::PrivateKey;
use crate::ssh::transport::{HalfTransport, HostKeyVerifier};
use crate::ssh::version::Version;
use piper_platform::{PiperError, PiperResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Default login grace time.
pub const DEFAULT_LOGIN_GRACE_TIME: Duration = Duration::from_secs(30);

/// Settings shared by every pipe of a listener.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Host keys offered to downstream clients
    pub host_keys: Arc<Vec<PrivateKey>>,
    /// Time allowed from accept until the upstream accepts authentication
    pub login_grace_time: Duration,
    /// Identification sent to downstream clients
    pub server_version: Version,
    /// Identification sent to upstream servers
    pub client_version: Version,
    /// Hooks for packets read from the downstream
    pub downstream_hooks: HookChain,
    /// Hooks for packets read from the upstream
    pub upstream_hooks: HookChain,
    /// PROXY protocol handling; `None` disables it
    pub proxy_protocol: Option<ProxyProtocolConfig>,
}

impl PipeConfig {
    /// Defaults around the given host keys.
    pub fn new(host_keys: Vec<PrivateKey>) -> Self {
        Self {
            host_keys: Arc::new(host_keys),
            login_grace_time: DEFAULT_LOGIN_GRACE_TIME,
            server_version: Version::new("SSHPiper", None),
            client_version: Version::new("SSHPiper", None),
            downstream_hooks: HookChain::new(),
            upstream_hooks: HookChain::new(),
            proxy_protocol: None,
        }
    }
}

/// Dials upstreams over TCP.
pub struct TcpConnector {
    identification: Version,
}

impl TcpConnector {
    /// Connector announcing `identification` to upstreams.
    pub fn new(identification: Version) -> Self {
        Self { identification }
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(
        &mut self,
        upstream: &Upstream,
        verifier: &mut dyn HostKeyVerifier,
    ) -> PiperResult<HalfTransport> {
        let stream = TcpStream::connect((upstream.host.as_str(), upstream.port))
            .await
            .map_err(|e| {
                PiperError::Upstream(format!("cannot reach {}: {}", upstream.address(), e))
            })?;
        stream.set_nodelay(true)?;
        debug!(upstream = %upstream.address(), "upstream TCP connected");
        HalfTransport::handshake_noauth_client(stream, self.identification.clone(), verifier).await
    }
}

/// Counts a pipe as active for as long as it lives.
struct ActivePipe(Arc<AtomicUsize>);

impl ActivePipe {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActivePipe {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a pipe holds before it reaches the shuttle; kept outside the timed
/// part so that teardown still has it after a timeout.
struct PipeState<C> {
    downstream: Option<HalfTransport>,
    ctx: Option<C>,
}

/// Accepts connections and runs pipes.
pub struct Supervisor<R: Router> {
    config: Arc<PipeConfig>,
    router: Arc<R>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl<R: Router> Supervisor<R> {
    /// Creates a supervisor.
    pub fn new(config: PipeConfig, router: R) -> Self {
        Self {
            config: Arc::new(config),
            router: Arc::new(router),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of pipes currently running.
    pub fn active_pipes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// Accept errors and pipe failures are logged; the loop keeps going.
    /// Running pipes observe `shutdown` through child tokens.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> PiperResult<()> {
        info!(addr = %listener.local_addr()?, "listening for SSH connections");
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("listener shutting down");
                    return Ok(());
                }
            };
            self.spawn_pipe(stream, peer, shutdown.child_token());
        }
    }

    /// Runs one accepted connection as a pipe task.
    pub fn spawn_pipe(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pipe = Pipe {
            config: self.config.clone(),
            router: self.router.clone(),
            _active: ActivePipe::new(self.active.clone()),
        };
        let span = info_span!("pipe", id, remote_addr = %peer);
        tokio::spawn(
            async move {
                match pipe.run(stream, peer, token).await {
                    Ok(()) => debug!("pipe finished"),
                    Err(e) if e.is_eof() => debug!(error = %e, "pipe closed by peer"),
                    Err(e) => warn!(error = %e, "pipe failed"),
                }
            }
            .instrument(span),
        )
    }
}

struct Pipe<R: Router> {
    config: Arc<PipeConfig>,
    router: Arc<R>,
    _active: ActivePipe,
}

impl<R: Router> Pipe<R> {
    async fn run(
        self,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> PiperResult<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "cannot set TCP_NODELAY");
        }
        let mut state = PipeState {
            downstream: None,
            ctx: None,
        };
        let grace = self.config.login_grace_time;

        let establishing = tokio::time::timeout(grace, self.establish(stream, peer, &mut state));
        let established = tokio::select! {
            result = establishing => match result {
                Ok(result) => result,
                Err(_) => Err(PiperError::Timeout(format!(
                    "login grace time of {:?} exceeded",
                    grace
                ))),
            },
            _ = token.cancelled() => Err(PiperError::Other("proxy shutting down".into())),
        };

        match established {
            Ok(BridgeOutcome::Authenticated { upstream, user }) => {
                let downstream = state
                    .downstream
                    .take()
                    .ok_or_else(|| {
                        PiperError::Protocol("downstream lost before shuttle".to_string())
                    })?;
                info!(user = %user, "pipe established");
                let hooks = (
                    self.config.downstream_hooks.clone(),
                    self.config.upstream_hooks.clone(),
                );
                let result = Shuttle::new(downstream, upstream)
                    .with_hooks(hooks.0, hooks.1)
                    .run(token)
                    .await;
                if let Some(ctx) = state.ctx.as_mut() {
                    self.router.on_pipe_close(ctx, result.as_ref().err()).await;
                }
                result
            }
            Ok(BridgeOutcome::Rejected { reason, description }) => {
                info!(reason = ?reason, "authentication rejected");
                let error = PiperError::Auth(description);
                self.teardown(&mut state, reason, &error).await;
                Ok(())
            }
            Err(e) => {
                let reason = DisconnectReason::from_code(e.disconnect_code());
                self.teardown(&mut state, reason, &e).await;
                Err(e)
            }
        }
    }

    /// Everything up to `Authenticated`.
    async fn establish(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        state: &mut PipeState<R::Context>,
    ) -> PiperResult<BridgeOutcome> {
        let mut stream = BufReader::new(stream);
        let remote_addr = match &self.config.proxy_protocol {
            Some(proxy) => resolve_remote_addr(&mut stream, peer, proxy).await?,
            None => peer,
        };

        let downstream = HalfTransport::handshake_noauth_server(
            stream,
            self.config.server_version.clone(),
            self.config.host_keys.clone(),
        )
        .await?;
        let downstream = state.downstream.insert(downstream);

        let first = read_auth_request(downstream).await?;
        let meta = ConnectionMeta {
            user: first.user_name().to_string(),
            remote_addr,
            client_version: downstream.peer_version().to_string(),
            session_id: downstream.session_id().to_vec(),
        };
        info!(
            user = %meta.user,
            client = %meta.client_version,
            %remote_addr,
            "downstream ready for authentication"
        );

        let ctx = state.ctx.insert(self.router.new_context(&meta).await?);
        let mut connector = TcpConnector::new(self.config.client_version.clone());
        AuthBridge::new(self.router.as_ref(), ctx, downstream, &mut connector, meta.user)
            .run(first)
            .await
    }

    /// Disconnects the downstream if it got far enough and tells the router.
    async fn teardown(
        &self,
        state: &mut PipeState<R::Context>,
        reason: DisconnectReason,
        error: &PiperError,
    ) {
        if let Some(downstream) = state.downstream.as_ref() {
            if !error.is_eof() {
                if let Err(e) = downstream.disconnect(reason, &error.to_string()).await {
                    debug!(error = %e, "could not send disconnect");
                }
            }
        }
        if let Some(ctx) = state.ctx.as_mut() {
            self.router.on_pipe_close(ctx, Some(error)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::{AuthFailure, AuthMethod, AuthRequest, SERVICE_CONNECTION};
    use crate::ssh::hostkey::PublicKey;
    use crate::ssh::message::{Disconnect, MessageType};
    use crate::ssh::piper::router::{AuthDecision, Decision, HostKeyPolicy};
    use std::sync::Mutex;

    struct AnyKey;

    #[async_trait::async_trait]
    impl HostKeyVerifier for AnyKey {
        async fn verify(&mut self, _key: &PublicKey, _blob: &[u8]) -> PiperResult<()> {
            Ok(())
        }
    }

    /// Answers every password with `decision` and records close reasons.
    struct Recording {
        decision: AuthDecision,
        upstream: Upstream,
        closed: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl Recording {
        fn new(decision: AuthDecision) -> Self {
            Self {
                decision,
                // Port 9 on loopback is not expected to accept connections
                upstream: Upstream::new("127.0.0.1", 9).with_host_key(HostKeyPolicy::Ignore),
                closed: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait::async_trait]
    impl Router for Recording {
        type Context = ();

        async fn new_context(&self, _meta: &ConnectionMeta) -> PiperResult<()> {
            Ok(())
        }

        fn supported_methods(&self, _ctx: &()) -> Vec<String> {
            vec!["password".to_string()]
        }

        async fn on_password(&self, _ctx: &mut (), _password: &[u8]) -> PiperResult<Decision> {
            Ok(Decision::new(self.decision.clone()).via(self.upstream.clone()))
        }

        async fn on_pipe_close(&self, _ctx: &mut (), reason: Option<&PiperError>) {
            self.closed
                .lock()
                .unwrap()
                .push(reason.map(|e| e.to_string()));
        }
    }

    async fn listen(
        config: PipeConfig,
        router: Recording,
    ) -> (SocketAddr, Arc<Supervisor<Recording>>, CancellationToken, JoinHandle<PiperResult<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let supervisor = Arc::new(Supervisor::new(config, router));
        let shutdown = CancellationToken::new();
        let (serving, token) = (supervisor.clone(), shutdown.clone());
        let handle = tokio::spawn(async move { serving.serve(listener, token).await });
        (addr, supervisor, shutdown, handle)
    }

    async fn client(addr: SocketAddr) -> HalfTransport {
        let stream = TcpStream::connect(addr).await.unwrap();
        HalfTransport::handshake_noauth_client(stream, Version::new("Client", None), &mut AnyKey)
            .await
            .unwrap()
    }

    async fn idle(supervisor: &Supervisor<Recording>) -> bool {
        for _ in 0..100 {
            if supervisor.active_pipes() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn config() -> PipeConfig {
        PipeConfig::new(vec![PrivateKey::generate_ed25519()])
    }

    #[test]
    fn test_active_pipe_counter() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ActivePipe::new(counter.clone());
        let second = ActivePipe::new(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(first);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pipe_config_defaults() {
        let config = config();
        assert_eq!(config.login_grace_time, DEFAULT_LOGIN_GRACE_TIME);
        assert_eq!(config.server_version.software(), "SSHPiper");
        assert!(config.downstream_hooks.is_empty());
        assert!(config.proxy_protocol.is_none());
    }

    #[tokio::test]
    async fn test_serve_returns_on_shutdown() {
        let router = Recording::new(AuthDecision::Discard);
        let (_, _, shutdown, handle) = listen(config(), router).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_grace_timeout_releases_pipe() {
        let mut config = config();
        config.login_grace_time = Duration::from_millis(200);
        let router = Recording::new(AuthDecision::Discard);
        let closed = router.closed.clone();
        let (addr, supervisor, _shutdown, _) = listen(config, router).await;

        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.active_pipes(), 1);
        assert!(idle(&supervisor).await);
        // No auth request arrived, so no context was ever created
        assert!(closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_keeps_pipe_open() {
        let router = Recording::new(AuthDecision::Discard);
        let (addr, supervisor, _shutdown, _) = listen(config(), router).await;
        let mut client = client(addr).await;

        for _ in 0..2 {
            let request = AuthRequest::new("amy", SERVICE_CONNECTION, AuthMethod::password(b"pw"));
            client.write_packet(&request.to_bytes()).await.unwrap();
            let failure = AuthFailure::from_bytes(&client.read_packet().await.unwrap()).unwrap();
            assert_eq!(failure.methods_can_continue(), ["password".to_string()]);
        }
        assert_eq!(supervisor.active_pipes(), 1);
    }

    #[tokio::test]
    async fn test_reject_closes_pipe_and_notifies_router() {
        let router = Recording::new(AuthDecision::Reject {
            code: None,
            methods: vec!["password".to_string()],
        });
        let closed = router.closed.clone();
        let (addr, supervisor, _shutdown, _) = listen(config(), router).await;
        let mut client = client(addr).await;

        let request = AuthRequest::new("amy", SERVICE_CONNECTION, AuthMethod::password(b"pw"));
        client.write_packet(&request.to_bytes()).await.unwrap();
        assert_eq!(client.read_packet().await.unwrap()[0], MessageType::UserauthFailure as u8);
        let disconnect = Disconnect::from_bytes(&client.read_packet().await.unwrap()).unwrap();
        assert_eq!(disconnect.reason, DisconnectReason::NoMoreAuthMethodsAvailable);

        assert!(idle(&supervisor).await);
        assert_eq!(closed.lock().unwrap().len(), 1);
        assert!(closed.lock().unwrap()[0].is_some());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_disconnects_client() {
        let (addr, supervisor, _shutdown, _) =
            listen(config(), Recording::new(AuthDecision::Passthrough)).await;
        let mut client = client(addr).await;

        let request = AuthRequest::new("amy", SERVICE_CONNECTION, AuthMethod::password(b"pw"));
        client.write_packet(&request.to_bytes()).await.unwrap();
        let reply = client.read_packet().await.unwrap();
        assert_eq!(reply[0], MessageType::Disconnect as u8);
        assert!(idle(&supervisor).await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_waiting_pipes() {
        let router = Recording::new(AuthDecision::Discard);
        let (addr, supervisor, shutdown, _) = listen(config(), router).await;
        let _client = client(addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.active_pipes(), 1);

        shutdown.cancel();
        assert!(idle(&supervisor).await);
    }
}
