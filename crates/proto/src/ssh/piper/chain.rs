//! Ordered composition of routers.
//!
//! A [`ChainRouter`] asks its routers in order. The current router answers
//! every attempt until it returns [`AuthDecision::DelegateToNext`]; the chain
//! then advances its per-connection index and replays the same attempt on
//! the next router. Running off the end rejects the connection.

use super::router::{
    AuthAttempt, AuthDecision, ConnectionMeta, Decision, DownstreamPrompter, Router,
};
use crate::ssh::message::DisconnectReason;
use piper_platform::{PiperError, PiperResult};
use tracing::debug;

/// Per-connection state of a [`ChainRouter`].
pub struct ChainContext<C> {
    index: usize,
    contexts: Vec<C>,
}

impl<C> ChainContext<C> {
    /// Index of the router currently in charge.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Routers tried in order; see the [module documentation](self).
pub struct ChainRouter<R> {
    routers: Vec<R>,
}

impl<R: Router> ChainRouter<R> {
    /// Builds a chain.
    ///
    /// # Errors
    ///
    /// [`PiperError::Config`] for an empty list.
    pub fn new(routers: Vec<R>) -> PiperResult<Self> {
        if routers.is_empty() {
            return Err(PiperError::Config("router chain is empty".to_string()));
        }
        Ok(Self { routers })
    }

    /// Number of routers.
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    /// Always false; a chain holds at least one router.
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    fn current<'a>(
        &'a self,
        ctx: &'a mut ChainContext<R::Context>,
    ) -> Option<(&'a R, &'a mut R::Context)> {
        let router = self.routers.get(ctx.index)?;
        let inner = ctx.contexts.get_mut(ctx.index)?;
        Some((router, inner))
    }
}

#[async_trait::async_trait]
impl<R: Router> Router for ChainRouter<R> {
    type Context = ChainContext<R::Context>;

    async fn new_context(&self, meta: &ConnectionMeta) -> PiperResult<Self::Context> {
        let mut contexts = Vec::with_capacity(self.routers.len());
        for router in &self.routers {
            contexts.push(router.new_context(meta).await?);
        }
        Ok(ChainContext { index: 0, contexts })
    }

    fn supported_methods(&self, ctx: &Self::Context) -> Vec<String> {
        match (self.routers.get(ctx.index), ctx.contexts.get(ctx.index)) {
            (Some(router), Some(inner)) => router.supported_methods(inner),
            _ => Vec::new(),
        }
    }

    async fn verify_upstream_host_key(
        &self,
        ctx: &mut Self::Context,
        host: &str,
        port: u16,
        key: &[u8],
    ) -> PiperResult<()> {
        match self.current(ctx) {
            Some((router, inner)) => router.verify_upstream_host_key(inner, host, port, key).await,
            None => Err(PiperError::Handshake(format!(
                "no router left to check host key of {}",
                host
            ))),
        }
    }

    fn trusted_user_ca_keys(&self, ctx: &Self::Context) -> Vec<Vec<u8>> {
        match (self.routers.get(ctx.index), ctx.contexts.get(ctx.index)) {
            (Some(router), Some(inner)) => router.trusted_user_ca_keys(inner),
            _ => Vec::new(),
        }
    }

    async fn on_auth_success(&self, ctx: &mut Self::Context) {
        if let Some((router, inner)) = self.current(ctx) {
            router.on_auth_success(inner).await;
        }
    }

    async fn on_pipe_close(&self, ctx: &mut Self::Context, reason: Option<&PiperError>) {
        for (router, inner) in self.routers.iter().zip(ctx.contexts.iter_mut()) {
            router.on_pipe_close(inner, reason).await;
        }
    }

    async fn decide(
        &self,
        ctx: &mut Self::Context,
        attempt: &AuthAttempt,
        prompter: &mut dyn DownstreamPrompter,
    ) -> PiperResult<Decision> {
        loop {
            let Some((router, inner)) = self.current(ctx) else {
                debug!(method = attempt.method(), "router chain exhausted");
                return Ok(Decision::reject(DisconnectReason::NoMoreAuthMethodsAvailable));
            };
            let decision = router.decide(inner, attempt, prompter).await?;
            if !matches!(decision.action, AuthDecision::DelegateToNext) {
                return Ok(decision);
            }
            ctx.index += 1;
            debug!(index = ctx.index, method = attempt.method(), "delegating to next router");
        }
    }
}
