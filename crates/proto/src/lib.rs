//! SSH half-transports and the authentication-rewriting piping engine.
//!
//! The crate terminates SSH on both sides of a proxy: a server-role
//! half-transport faces the client, a client-role half-transport faces the
//! backend. Between them, a [`Router`](ssh::piper::Router) decides where
//! each connection goes and how its authentication is translated.
//!
//! # Features
//!
//! - `ssh` (default) - everything in [`ssh`]
//!
//! # Example
//!
//! ```rust,no_run
//! use piper_proto::ssh::piper::{
//!     AuthDecision, ConnectionMeta, Decision, PipeConfig, Router, Supervisor, Upstream,
//! };
//! use piper_proto::ssh::PrivateKey;
//! use piper_platform::PiperResult;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Backend;
//!
//! #[async_trait::async_trait]
//! impl Router for Backend {
//!     type Context = ();
//!
//!     async fn new_context(&self, _meta: &ConnectionMeta) -> PiperResult<()> {
//!         Ok(())
//!     }
//!
//!     fn supported_methods(&self, _ctx: &()) -> Vec<String> {
//!         vec!["password".to_string()]
//!     }
//!
//!     async fn on_password(&self, _ctx: &mut (), _password: &[u8]) -> PiperResult<Decision> {
//!         Ok(Decision::new(AuthDecision::Passthrough).via(Upstream::new("10.0.0.5", 22)))
//!     }
//! }
//!
//! # async fn run() -> PiperResult<()> {
//! let config = PipeConfig::new(vec![PrivateKey::generate_ed25519()]);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:2222").await?;
//! Supervisor::new(config, Backend)
//!     .serve(listener, CancellationToken::new())
//!     .await
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Downstream publickey signatures are never forwarded; the proxy signs
//!   again over the upstream session
//! - Secrets are zeroized with `zeroize`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
