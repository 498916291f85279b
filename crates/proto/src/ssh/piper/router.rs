//! Routing interface consumed by the auth bridge.
//!
//! A [`Router`] decides, per downstream connection, which upstream to dial
//! and how to authenticate there. The bridge calls [`Router::decide`] once
//! per downstream auth attempt; its provided implementation dispatches to
//! the per-method callbacks, so most routers only override those.
//!
//! # Example
//!
//! ```rust
//! use piper_proto::ssh::piper::router::{
//!     AuthDecision, ConnectionMeta, Decision, Router, Upstream,
//! };
//! use piper_platform::PiperResult;
//!
//! struct ToBackend;
//!
//! #[async_trait::async_trait]
//! impl Router for ToBackend {
//!     type Context = String;
//!
//!     async fn new_context(&self, meta: &ConnectionMeta) -> PiperResult<String> {
//!         Ok(meta.user.clone())
//!     }
//!
//!     fn supported_methods(&self, _ctx: &String) -> Vec<String> {
//!         vec!["password".to_string()]
//!     }
//!
//!     async fn on_password(&self, _ctx: &mut String, _password: &[u8]) -> PiperResult<Decision> {
//!         Ok(Decision::new(AuthDecision::Passthrough).via(Upstream::new("10.0.0.5", 22)))
//!     }
//! }
//! ```

use crate::ssh::auth::InfoRequest;
use crate::ssh::message::DisconnectReason;
use crate::ssh::privatekey::PrivateKey;
use piper_platform::{PiperError, PiperResult};
use std::net::SocketAddr;
use std::sync::Arc;
use zeroize::Zeroizing;

/// What the downstream client told us about itself before authenticating.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// User name from the first auth request
    pub user: String,
    /// Client address, taken from the PROXY header when one was accepted
    pub remote_addr: SocketAddr,
    /// Client identification line
    pub client_version: String,
    /// Downstream session identifier
    pub session_id: Vec<u8>,
}

/// How the upstream host key is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key.
    Ignore,
    /// Match against known_hosts content.
    KnownHosts(String),
    /// Match exactly this key blob.
    Fixed(Vec<u8>),
    /// Ask [`Router::verify_upstream_host_key`].
    Router,
}

/// Where a pipe goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Mapped user; empty keeps the downstream user
    pub user: String,
    /// Host key check
    pub host_key: HostKeyPolicy,
}

impl Upstream {
    /// Upstream with the downstream user kept and host key checking left to
    /// the router.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            host_key: HostKeyPolicy::Router,
        }
    }

    /// Sets the mapped user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the host key policy.
    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One downstream auth attempt as seen by the router.
#[derive(Clone)]
pub enum AuthAttempt {
    /// "none"
    None,
    /// "password"
    Password(Zeroizing<Vec<u8>>),
    /// "publickey" without a signature
    PublicKeyQuery {
        /// Algorithm name
        algorithm: String,
        /// Key or certificate blob
        public_key: Vec<u8>,
    },
    /// "publickey" with a signature
    PublicKey {
        /// Algorithm name
        algorithm: String,
        /// Key or certificate blob
        public_key: Vec<u8>,
        /// Whether the signature verified against the downstream session
        verified: bool,
    },
    /// "keyboard-interactive"
    KeyboardInteractive {
        /// Submethod hints from the client
        submethods: String,
    },
}

impl AuthAttempt {
    /// Wire name of the method.
    pub fn method(&self) -> &'static str {
        match self {
            AuthAttempt::None => "none",
            AuthAttempt::Password(_) => "password",
            AuthAttempt::PublicKeyQuery { .. } | AuthAttempt::PublicKey { .. } => "publickey",
            AuthAttempt::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl std::fmt::Debug for AuthAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthAttempt::PublicKeyQuery { algorithm, .. } => {
                write!(f, "PublicKeyQuery({})", algorithm)
            }
            AuthAttempt::PublicKey {
                algorithm,
                verified,
                ..
            } => write!(f, "PublicKey({}, verified={})", algorithm, verified),
            other => f.write_str(other.method()),
        }
    }
}

/// What to do with an auth attempt.
#[derive(Clone)]
pub enum AuthDecision {
    /// Forward the downstream request with the user rewritten.
    Passthrough,
    /// Send `none` upstream.
    MapToNone,
    /// Send this password upstream.
    MapToPassword(Zeroizing<Vec<u8>>),
    /// Sign upstream with this key.
    MapToPrivateKey(Arc<PrivateKey>),
    /// Answer FAILURE and wait for the next attempt.
    Discard,
    /// End the pipe. With a code the downstream gets DISCONNECT, otherwise
    /// FAILURE listing `methods` before the connection is closed.
    Reject {
        /// Disconnect reason
        code: Option<DisconnectReason>,
        /// Methods listed in the FAILURE
        methods: Vec<String>,
    },
    /// Let the next router of a [`ChainRouter`](super::chain::ChainRouter)
    /// decide.
    DelegateToNext,
}

impl AuthDecision {
    /// Whether acting on the decision writes to the upstream.
    pub fn needs_upstream(&self) -> bool {
        matches!(
            self,
            AuthDecision::Passthrough
                | AuthDecision::MapToNone
                | AuthDecision::MapToPassword(_)
                | AuthDecision::MapToPrivateKey(_)
        )
    }
}

impl std::fmt::Debug for AuthDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthDecision::Passthrough => f.write_str("Passthrough"),
            AuthDecision::MapToNone => f.write_str("MapToNone"),
            AuthDecision::MapToPassword(_) => f.write_str("MapToPassword"),
            AuthDecision::MapToPrivateKey(key) => write!(f, "MapToPrivateKey({:?})", key),
            AuthDecision::Discard => f.write_str("Discard"),
            AuthDecision::Reject { code, methods } => f
                .debug_struct("Reject")
                .field("code", code)
                .field("methods", methods)
                .finish(),
            AuthDecision::DelegateToNext => f.write_str("DelegateToNext"),
        }
    }
}

/// A decision plus, the first time one is needed, the upstream to dial.
#[derive(Debug, Clone)]
pub struct Decision {
    /// What to do
    pub action: AuthDecision,
    /// Target; ignored once the pipe has one
    pub upstream: Option<Upstream>,
}

impl Decision {
    /// Decision without an upstream.
    pub fn new(action: AuthDecision) -> Self {
        Self {
            action,
            upstream: None,
        }
    }

    /// Attaches the upstream target.
    pub fn via(mut self, upstream: Upstream) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Terminal rejection with a DISCONNECT.
    pub fn reject(code: DisconnectReason) -> Self {
        Self::new(AuthDecision::Reject {
            code: Some(code),
            methods: Vec::new(),
        })
    }
}

/// Lets a router run keyboard-interactive rounds against the downstream.
#[async_trait::async_trait]
pub trait DownstreamPrompter: Send {
    /// Sends one INFO_REQUEST and returns the answers in prompt order.
    async fn prompt(&mut self, request: InfoRequest) -> PiperResult<Vec<Zeroizing<String>>>;
}

/// Per-connection routing policy.
///
/// The core calls into one context from one pipe at a time; a router shared
/// by many pipes does its own synchronisation.
///
/// Every `on_*` callback defaults to [`AuthDecision::Discard`], so a router
/// only implements the methods it routes.
#[async_trait::async_trait]
pub trait Router: Send + Sync + 'static {
    /// Per-connection state.
    type Context: Send + 'static;

    /// Creates the context after the first downstream auth request.
    async fn new_context(&self, meta: &ConnectionMeta) -> PiperResult<Self::Context>;

    /// Methods the downstream may use, in preference order.
    fn supported_methods(&self, ctx: &Self::Context) -> Vec<String>;

    /// Downstream sent `none`.
    async fn on_none(&self, _ctx: &mut Self::Context) -> PiperResult<Decision> {
        Ok(Decision::new(AuthDecision::Discard))
    }

    /// Downstream sent a password.
    async fn on_password(
        &self,
        _ctx: &mut Self::Context,
        _password: &[u8],
    ) -> PiperResult<Decision> {
        Ok(Decision::new(AuthDecision::Discard))
    }

    /// Downstream asks whether a key would be accepted.
    async fn on_publickey_query(
        &self,
        _ctx: &mut Self::Context,
        _algorithm: &str,
        _public_key: &[u8],
    ) -> PiperResult<Decision> {
        Ok(Decision::new(AuthDecision::Discard))
    }

    /// Downstream signed with a key.
    ///
    /// # Arguments
    ///
    /// * `verified` - the signature checked out against the downstream
    ///   session; attempts with bad signatures never reach the router
    async fn on_publickey(
        &self,
        _ctx: &mut Self::Context,
        _algorithm: &str,
        _public_key: &[u8],
        _verified: bool,
    ) -> PiperResult<Decision> {
        Ok(Decision::new(AuthDecision::Discard))
    }

    /// Downstream chose keyboard-interactive. The router may run prompt
    /// rounds through `prompter` before deciding.
    async fn on_keyboard_interactive(
        &self,
        _ctx: &mut Self::Context,
        _prompter: &mut dyn DownstreamPrompter,
    ) -> PiperResult<Decision> {
        Ok(Decision::new(AuthDecision::Discard))
    }

    /// Checks an upstream host key under [`HostKeyPolicy::Router`].
    ///
    /// The default rejects every key.
    async fn verify_upstream_host_key(
        &self,
        _ctx: &mut Self::Context,
        host: &str,
        _port: u16,
        _key: &[u8],
    ) -> PiperResult<()> {
        Err(PiperError::Handshake(format!(
            "no host key policy for upstream {}",
            host
        )))
    }

    /// CA keys trusted to sign downstream user certificates.
    fn trusted_user_ca_keys(&self, _ctx: &Self::Context) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// The upstream accepted the pipe.
    async fn on_auth_success(&self, _ctx: &mut Self::Context) {}

    /// The pipe is gone; `reason` is `None` for an orderly close.
    async fn on_pipe_close(&self, _ctx: &mut Self::Context, _reason: Option<&PiperError>) {}

    /// Single entry point used by the auth bridge.
    async fn decide(
        &self,
        ctx: &mut Self::Context,
        attempt: &AuthAttempt,
        prompter: &mut dyn DownstreamPrompter,
    ) -> PiperResult<Decision> {
        match attempt {
            AuthAttempt::None => self.on_none(ctx).await,
            AuthAttempt::Password(password) => self.on_password(ctx, password).await,
            AuthAttempt::PublicKeyQuery {
                algorithm,
                public_key,
            } => self.on_publickey_query(ctx, algorithm, public_key).await,
            AuthAttempt::PublicKey {
                algorithm,
                public_key,
                verified,
            } => self.on_publickey(ctx, algorithm, public_key, *verified).await,
            AuthAttempt::KeyboardInteractive { .. } => {
                self.on_keyboard_interactive(ctx, prompter).await
            }
        }
    }
}
