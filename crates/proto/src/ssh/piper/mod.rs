//! The piping engine.
//!
//! A pipe joins a downstream client and an upstream server through two
//! [`HalfTransport`](crate::ssh::transport::HalfTransport)s:
//!
//! - [`router`] - the routing interface the engine consults
//! - [`chain`] - ordered composition of routers
//! - [`bridge`] - the auth phase, rewriting requests per router decision
//! - [`shuttle`] - packet forwarding after authentication
//! - [`hook`] - per-direction packet hooks run by the shuttle
//! - [`proxy_protocol`] - PROXY headers from load balancers
//! - [`supervisor`] - listener and per-pipe orchestration

pub mod bridge;
pub mod chain;
pub mod hook;
pub mod proxy_protocol;
pub mod router;
pub mod shuttle;
pub mod supervisor;

pub use bridge::{AuthBridge, BridgeOutcome, BridgeState, PolicyVerifier, UpstreamConnector};
pub use chain::{ChainContext, ChainRouter};
pub use hook::{DropHostkeysMessage, HookAction, HookChain, PacketHook, ReplyPing};
pub use proxy_protocol::ProxyProtocolConfig;
pub use router::{
    AuthAttempt, AuthDecision, ConnectionMeta, Decision, DownstreamPrompter, HostKeyPolicy,
    Router, Upstream,
};
pub use shuttle::Shuttle;
pub use supervisor::{PipeConfig, Supervisor, TcpConnector};
