//! Auth bridge: the `ssh-userauth` exchange between the two halves of a pipe.
//!
//! The bridge reads USERAUTH_REQUESTs from the downstream client, asks the
//! [`Router`] what to do with each one and, when the decision involves the
//! upstream, writes a (possibly rewritten) request there and relays the
//! reply. It never forwards a downstream publickey signature: signatures are
//! bound to the downstream session ID, so they are either re-made with a
//! router-supplied key over the upstream session ID or replaced by `none`.
//!
//! ```text
//!  AwaitDownstreamReq --request--> ConsultingRouter --Discard--> AwaitDownstreamReq
//!                                       |  |
//!                                       |  +--Reject--> Rejected
//!                                       v
//!                                AwaitUpstreamReply --FAILURE--> AwaitDownstreamReq
//!                                   |     ^   |
//!                     INFO_REQUEST  |     |   +--SUCCESS--> Authenticated
//!                                   v     |
//!                                RepromptDownstream
//! ```

use super::router::{
    AuthAttempt, AuthDecision, Decision, DownstreamPrompter, HostKeyPolicy, Router, Upstream,
};
use crate::ssh::auth::{
    construct_signature_data, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, InfoRequest,
    InfoResponse,
};
use crate::ssh::certificate::{
    is_certificate_algorithm, signature_algorithm, validate_user_certificate,
};
use crate::ssh::hostkey::PublicKey;
use crate::ssh::known_hosts::{HostKeyStatus, KnownHosts};
use crate::ssh::message::{
    message_name, Disconnect, DisconnectReason, MessageType, USERAUTH_INFO_REQUEST,
};
use crate::ssh::privatekey::PrivateKey;
use crate::ssh::transport::{HalfTransport, HostKeyVerifier};
use piper_platform::{PiperError, PiperResult};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

/// Where the bridge is in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for the next downstream USERAUTH_REQUEST
    AwaitDownstreamReq,
    /// Waiting for the router's decision
    ConsultingRouter,
    /// Waiting for the upstream's answer to a forwarded request
    AwaitUpstreamReply,
    /// Waiting for the downstream's INFO_RESPONSE
    RepromptDownstream,
    /// Upstream accepted
    Authenticated,
    /// Pipe refused
    Rejected,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BridgeState::AwaitDownstreamReq => "await-downstream-req",
            BridgeState::ConsultingRouter => "consulting-router",
            BridgeState::AwaitUpstreamReply => "await-upstream-reply",
            BridgeState::RepromptDownstream => "reprompt-downstream",
            BridgeState::Authenticated => "authenticated",
            BridgeState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// How an auth phase ended without an error.
#[derive(Debug)]
pub enum BridgeOutcome {
    /// The upstream sent USERAUTH_SUCCESS, which has been relayed.
    Authenticated {
        /// Authenticated upstream half
        upstream: HalfTransport,
        /// User name the upstream accepted
        user: String,
    },
    /// The router refused the pipe; the downstream should be disconnected.
    Rejected {
        /// Disconnect reason to send
        reason: DisconnectReason,
        /// Disconnect description
        description: String,
    },
}

/// Opens the upstream half of a pipe.
#[async_trait::async_trait]
pub trait UpstreamConnector: Send {
    /// Dials `upstream` and runs the client-role handshake, checking the
    /// host key with `verifier`.
    async fn connect(
        &mut self,
        upstream: &Upstream,
        verifier: &mut dyn HostKeyVerifier,
    ) -> PiperResult<HalfTransport>;
}

/// Reads the next USERAUTH_REQUEST from the downstream, skipping IGNORE and
/// DEBUG.
///
/// # Errors
///
/// [`PiperError::Disconnected`] when the client disconnects,
/// [`PiperError::Protocol`] for any other message.
pub async fn read_auth_request(downstream: &mut HalfTransport) -> PiperResult<AuthRequest> {
    loop {
        let packet = downstream.read_packet().await?;
        match MessageType::from_u8(packet[0]) {
            Some(MessageType::UserauthRequest) => return AuthRequest::from_bytes(&packet),
            Some(MessageType::Ignore) | Some(MessageType::Debug) => continue,
            Some(MessageType::Disconnect) => {
                return Err(Disconnect::from_bytes(&packet)?.into_error())
            }
            _ => {
                return Err(PiperError::Protocol(format!(
                    "expected USERAUTH_REQUEST, got {}",
                    message_name(packet[0])
                )))
            }
        }
    }
}

/// Keyboard-interactive rounds run by a router against the downstream.
struct Prompter<'a> {
    downstream: &'a mut HalfTransport,
}

#[async_trait::async_trait]
impl DownstreamPrompter for Prompter<'_> {
    async fn prompt(&mut self, request: InfoRequest) -> PiperResult<Vec<Zeroizing<String>>> {
        let expected = request.prompts.len();
        self.downstream.write_packet(&request.to_bytes()).await?;
        let response = read_info_response(self.downstream).await?;
        let response = InfoResponse::from_bytes(&response)?;
        if response.responses.len() != expected {
            return Err(PiperError::Protocol(format!(
                "{} answers to {} prompts",
                response.responses.len(),
                expected
            )));
        }
        Ok(response.responses)
    }
}

async fn read_info_response(downstream: &mut HalfTransport) -> PiperResult<Vec<u8>> {
    loop {
        let packet = downstream.read_packet().await?;
        match MessageType::from_u8(packet[0]) {
            Some(MessageType::UserauthInfoResponse) => return Ok(packet),
            Some(MessageType::Ignore) | Some(MessageType::Debug) => continue,
            Some(MessageType::Disconnect) => {
                return Err(Disconnect::from_bytes(&packet)?.into_error())
            }
            _ => {
                return Err(PiperError::Protocol(format!(
                    "expected INFO_RESPONSE, got {}",
                    message_name(packet[0])
                )))
            }
        }
    }
}

/// Applies an [`Upstream`]'s [`HostKeyPolicy`] during the upstream handshake.
pub struct PolicyVerifier<'a, R: Router> {
    router: &'a R,
    ctx: &'a mut R::Context,
    upstream: &'a Upstream,
}

impl<'a, R: Router> PolicyVerifier<'a, R> {
    /// Verifier for `upstream` that may consult `router`.
    pub fn new(router: &'a R, ctx: &'a mut R::Context, upstream: &'a Upstream) -> Self {
        Self {
            router,
            ctx,
            upstream,
        }
    }
}

#[async_trait::async_trait]
impl<R: Router> HostKeyVerifier for PolicyVerifier<'_, R> {
    async fn verify(&mut self, key: &PublicKey, blob: &[u8]) -> PiperResult<()> {
        let host = &self.upstream.host;
        let port = self.upstream.port;
        match &self.upstream.host_key {
            HostKeyPolicy::Ignore => {
                warn!(
                    upstream = %self.upstream.address(),
                    fingerprint = %key.fingerprint(),
                    "upstream host key not checked"
                );
                Ok(())
            }
            HostKeyPolicy::KnownHosts(data) => {
                match KnownHosts::parse(data)?.verify(host, port, blob) {
                    HostKeyStatus::Known => Ok(()),
                    HostKeyStatus::Changed => Err(PiperError::Handshake(format!(
                        "host key for {} has changed ({})",
                        self.upstream.address(),
                        key.fingerprint()
                    ))),
                    HostKeyStatus::Unknown => Err(PiperError::Handshake(format!(
                        "host key for {} not in known_hosts ({})",
                        self.upstream.address(),
                        key.fingerprint()
                    ))),
                }
            }
            HostKeyPolicy::Fixed(expected) => {
                if expected.as_slice() == blob {
                    Ok(())
                } else {
                    Err(PiperError::Handshake(format!(
                        "host key for {} does not match ({})",
                        self.upstream.address(),
                        key.fingerprint()
                    )))
                }
            }
            HostKeyPolicy::Router => {
                self.router
                    .verify_upstream_host_key(self.ctx, host, port, blob)
                    .await
            }
        }
    }
}

enum Step {
    NextRequest,
    Done(BridgeOutcome),
}

/// How to treat the upstream's reply to a forwarded request.
struct Forwarded {
    /// Relay FAILURE untouched instead of rebuilding it from the allowed
    /// methods.
    verbatim_failure: bool,
    /// Upstream may send INFO_REQUEST.
    keyboard_interactive: bool,
    /// Set when `none` stands in for a publickey query; the query's
    /// algorithm and key blob.
    query: Option<(String, Vec<u8>)>,
}

/// One pipe's auth phase; see the [module documentation](self).
pub struct AuthBridge<'a, R: Router> {
    router: &'a R,
    ctx: &'a mut R::Context,
    downstream: &'a mut HalfTransport,
    connector: &'a mut dyn UpstreamConnector,
    upstream: Option<HalfTransport>,
    target: Option<Upstream>,
    downstream_user: String,
    /// Methods the upstream's last FAILURE allowed
    upstream_methods: Option<Vec<String>>,
    /// USERAUTH_SUCCESS answering a `none` sent for a query
    held_success: Option<Vec<u8>>,
    state: BridgeState,
}

impl<'a, R: Router> AuthBridge<'a, R> {
    /// Creates a bridge for a downstream that has completed its handshake.
    ///
    /// # Arguments
    ///
    /// * `downstream_user` - user name of the first request; later requests
    ///   must keep it
    /// * `connector` - used once, on the first decision that writes upstream
    pub fn new(
        router: &'a R,
        ctx: &'a mut R::Context,
        downstream: &'a mut HalfTransport,
        connector: &'a mut dyn UpstreamConnector,
        downstream_user: impl Into<String>,
    ) -> Self {
        Self {
            router,
            ctx,
            downstream,
            connector,
            upstream: None,
            target: None,
            downstream_user: downstream_user.into(),
            upstream_methods: None,
            held_success: None,
            state: BridgeState::AwaitDownstreamReq,
        }
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Runs the exchange starting from an already-read request.
    ///
    /// # Errors
    ///
    /// Transport, handshake and protocol errors on either half, upstream dial
    /// failures, and non-recoverable router errors. Recoverable errors
    /// ([`PiperError::is_recoverable`]) are answered with FAILURE.
    pub async fn run(mut self, first: AuthRequest) -> PiperResult<BridgeOutcome> {
        let mut request = first;
        loop {
            match self.handle_request(&request).await? {
                Step::Done(outcome) => return Ok(outcome),
                Step::NextRequest => {
                    self.enter(BridgeState::AwaitDownstreamReq);
                    request = read_auth_request(self.downstream).await?;
                }
            }
        }
    }

    fn enter(&mut self, state: BridgeState) {
        trace!(from = %self.state, to = %state, "auth bridge transition");
        self.state = state;
    }

    fn mapped_user(&self) -> String {
        match &self.target {
            Some(target) if !target.user.is_empty() => target.user.clone(),
            _ => self.downstream_user.clone(),
        }
    }

    async fn refuse(&mut self) -> PiperResult<Step> {
        let methods = self.router.supported_methods(self.ctx);
        send_failure(self.downstream, methods, false).await?;
        Ok(Step::NextRequest)
    }

    async fn recover(&mut self, error: PiperError) -> PiperResult<Step> {
        if !error.is_recoverable() {
            return Err(error);
        }
        warn!(error = %error, "auth attempt failed");
        self.refuse().await
    }

    async fn handle_request(&mut self, request: &AuthRequest) -> PiperResult<Step> {
        if request.user_name() != self.downstream_user {
            return Err(PiperError::Protocol(format!(
                "user changed from {} to {} during authentication",
                self.downstream_user,
                request.user_name()
            )));
        }
        self.enter(BridgeState::ConsultingRouter);

        let method = request.method().name();
        let supported = self.router.supported_methods(self.ctx);
        if !supported.iter().any(|m| m == method) {
            debug!(method, "method not offered for this route");
            send_failure(self.downstream, supported, false).await?;
            return Ok(Step::NextRequest);
        }

        let attempt = match self.attempt_for(request) {
            Ok(attempt) => attempt,
            Err(e) => return self.recover(e).await,
        };
        debug!(user = %self.downstream_user, attempt = ?attempt, "consulting router");

        let mut prompter = Prompter {
            downstream: &mut *self.downstream,
        };
        let decision = match self.router.decide(self.ctx, &attempt, &mut prompter).await {
            Ok(decision) => decision,
            Err(e) => return self.recover(e).await,
        };
        self.apply(request, &attempt, decision).await
    }

    /// Turns a request into what the router sees, verifying signatures and
    /// certificates first.
    fn attempt_for(&self, request: &AuthRequest) -> PiperResult<AuthAttempt> {
        match request.method() {
            AuthMethod::None => Ok(AuthAttempt::None),
            AuthMethod::Password {
                new_password: Some(_),
                ..
            } => Err(PiperError::Auth("password change is not supported".to_string())),
            AuthMethod::Password { password, .. } => Ok(AuthAttempt::Password(password.clone())),
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let key = self.downstream_key(algorithm, public_key)?;
                match signature {
                    None => Ok(AuthAttempt::PublicKeyQuery {
                        algorithm: algorithm.clone(),
                        public_key: public_key.clone(),
                    }),
                    Some(signature) => {
                        let signed_with =
                            signature_algorithm(algorithm).unwrap_or(algorithm.as_str());
                        let data = construct_signature_data(
                            self.downstream.session_id(),
                            request.user_name(),
                            request.service_name(),
                            algorithm,
                            public_key,
                        );
                        if !key.verify(signed_with, &data, signature) {
                            return Err(PiperError::Auth(format!(
                                "bad {} signature from {}",
                                algorithm, self.downstream_user
                            )));
                        }
                        Ok(AuthAttempt::PublicKey {
                            algorithm: algorithm.clone(),
                            public_key: public_key.clone(),
                            verified: true,
                        })
                    }
                }
            }
            AuthMethod::KeyboardInteractive { submethods, .. } => {
                Ok(AuthAttempt::KeyboardInteractive {
                    submethods: submethods.clone(),
                })
            }
            AuthMethod::Other { name, .. } => Err(PiperError::Auth(format!(
                "method {} is not supported",
                name
            ))),
        }
    }

    /// Parses the downstream key, validating certificates against the
    /// router's CA keys.
    fn downstream_key(&self, algorithm: &str, blob: &[u8]) -> PiperResult<PublicKey> {
        if is_certificate_algorithm(algorithm) {
            let cas = self.router.trusted_user_ca_keys(self.ctx);
            return validate_user_certificate(blob, &self.downstream_user, &cas);
        }
        PublicKey::from_blob(blob)
            .map_err(|e| PiperError::Auth(format!("unusable public key: {}", e)))
    }

    async fn apply(
        &mut self,
        request: &AuthRequest,
        attempt: &AuthAttempt,
        decision: Decision,
    ) -> PiperResult<Step> {
        if self.target.is_none() {
            self.target = decision.upstream;
        }
        debug!(decision = ?decision.action, "router decided");

        if let AuthAttempt::PublicKeyQuery {
            algorithm,
            public_key,
        } = attempt
        {
            return self
                .answer_query(request, algorithm, public_key, decision.action)
                .await;
        }

        let action = match decision.action {
            AuthDecision::Passthrough if matches!(attempt, AuthAttempt::PublicKey { .. }) => {
                AuthDecision::MapToNone
            }
            other => other,
        };

        match action {
            AuthDecision::Passthrough => {
                if let Err(e) = self.ensure_upstream().await {
                    return self.recover(e).await;
                }
                let forwarded = Forwarded {
                    verbatim_failure: true,
                    keyboard_interactive: matches!(
                        request.method(),
                        AuthMethod::KeyboardInteractive { .. }
                    ),
                    query: None,
                };
                let rewritten = request.clone().with_user(&self.mapped_user());
                self.forward(rewritten, forwarded).await
            }
            AuthDecision::MapToNone => {
                self.forward_mapped(request, |_| Ok(AuthMethod::None)).await
            }
            AuthDecision::MapToPassword(password) => {
                self.forward_mapped(request, |_| Ok(AuthMethod::password(&password)))
                    .await
            }
            AuthDecision::MapToPrivateKey(signer) => {
                let service = request.service_name().to_string();
                let user = self.mapped_user();
                self.forward_mapped(request, |session_id| {
                    sign_again(&signer, session_id, &user, &service)
                })
                .await
            }
            other => self.settle(other).await,
        }
    }

    /// Answers a publickey query. A query never authenticates the downstream:
    /// it is either acknowledged with PK_OK, tested upstream with `none`, or
    /// refused.
    async fn answer_query(
        &mut self,
        request: &AuthRequest,
        algorithm: &str,
        public_key: &[u8],
        action: AuthDecision,
    ) -> PiperResult<Step> {
        match action {
            AuthDecision::MapToPrivateKey(_) => {
                // The key the client asked about is never shown to the upstream.
                self.send_pk_ok(algorithm, public_key).await?;
                Ok(Step::NextRequest)
            }
            AuthDecision::Passthrough if self.held_success.is_some() => {
                self.send_pk_ok(algorithm, public_key).await?;
                Ok(Step::NextRequest)
            }
            AuthDecision::Passthrough => {
                if let Err(e) = self.ensure_upstream().await {
                    return self.recover(e).await;
                }
                let forwarded = Forwarded {
                    verbatim_failure: false,
                    keyboard_interactive: false,
                    query: Some((algorithm.to_string(), public_key.to_vec())),
                };
                let none = AuthRequest::new(
                    &self.mapped_user(),
                    request.service_name(),
                    AuthMethod::None,
                );
                self.forward(none, forwarded).await
            }
            AuthDecision::MapToNone | AuthDecision::MapToPassword(_) => {
                debug!(algorithm, "query needs a signature before its mapping is used");
                let methods = self.allowed_methods();
                send_failure(self.downstream, methods, false).await?;
                Ok(Step::NextRequest)
            }
            other => self.settle(other).await,
        }
    }

    /// Decisions that never write upstream.
    async fn settle(&mut self, action: AuthDecision) -> PiperResult<Step> {
        match action {
            AuthDecision::DelegateToNext => {
                self.recover(PiperError::Routing(
                    "router delegated with no next router".to_string(),
                ))
                .await
            }
            AuthDecision::Reject {
                code: Some(reason),
                ..
            } => {
                self.enter(BridgeState::Rejected);
                Ok(Step::Done(BridgeOutcome::Rejected {
                    reason,
                    description: "authentication rejected".to_string(),
                }))
            }
            AuthDecision::Reject {
                code: None,
                methods,
            } => {
                send_failure(self.downstream, methods, false).await?;
                self.enter(BridgeState::Rejected);
                Ok(Step::Done(BridgeOutcome::Rejected {
                    reason: DisconnectReason::NoMoreAuthMethodsAvailable,
                    description: "no more authentication methods available".to_string(),
                }))
            }
            _ => self.refuse().await,
        }
    }

    async fn send_pk_ok(&mut self, algorithm: &str, public_key: &[u8]) -> PiperResult<()> {
        self.downstream
            .write_packet(&AuthPkOk::new(algorithm, public_key.to_vec()).to_bytes())
            .await
    }

    /// The router's methods, narrowed to those the upstream still allows
    /// once it has refused something.
    fn allowed_methods(&self) -> Vec<String> {
        let supported = self.router.supported_methods(self.ctx);
        match &self.upstream_methods {
            Some(upstream) => supported
                .into_iter()
                .filter(|method| upstream.contains(method))
                .collect(),
            None => supported,
        }
    }

    /// Dials the upstream on first use.
    async fn ensure_upstream(&mut self) -> PiperResult<()> {
        if self.upstream.is_some() {
            return Ok(());
        }
        let target = self.target.as_ref().ok_or_else(|| {
            PiperError::Routing("decision needs an upstream but none was given".to_string())
        })?;
        info!(upstream = %target.address(), user = %self.downstream_user, "connecting upstream");
        let mut verifier = PolicyVerifier::new(self.router, &mut *self.ctx, target);
        let transport = self.connector.connect(target, &mut verifier).await?;
        self.upstream = Some(transport);
        Ok(())
    }

    fn upstream_mut(&mut self) -> PiperResult<&mut HalfTransport> {
        self.upstream
            .as_mut()
            .ok_or_else(|| PiperError::Upstream("upstream not connected".to_string()))
    }

    /// Forwards a request built by the proxy. `build` receives the upstream
    /// session ID.
    async fn forward_mapped<F>(&mut self, request: &AuthRequest, build: F) -> PiperResult<Step>
    where
        F: FnOnce(&[u8]) -> PiperResult<AuthMethod> + Send,
    {
        if let Err(e) = self.ensure_upstream().await {
            return self.recover(e).await;
        }
        let method = build(self.upstream_mut()?.session_id())?;
        let forwarded = Forwarded {
            verbatim_failure: false,
            keyboard_interactive: false,
            query: None,
        };
        let mapped = AuthRequest::new(&self.mapped_user(), request.service_name(), method);
        self.forward(mapped, forwarded).await
    }

    async fn forward(&mut self, request: AuthRequest, forwarded: Forwarded) -> PiperResult<Step> {
        if let Some(success) = self.held_success.take() {
            // The upstream already accepted `none` while a query was tested.
            debug!("relaying upstream success held from a query");
            return self.complete(success).await;
        }
        debug!(user = %request.user_name(), method = ?request.method(), "forwarding auth request");
        self.upstream_mut()?.write_packet(&request.to_bytes()).await?;
        self.enter(BridgeState::AwaitUpstreamReply);
        self.await_upstream_reply(forwarded).await
    }

    /// Relays USERAUTH_SUCCESS and hands the upstream half over.
    async fn complete(&mut self, success: Vec<u8>) -> PiperResult<Step> {
        self.downstream.write_packet(&success).await?;
        self.router.on_auth_success(self.ctx).await;
        self.enter(BridgeState::Authenticated);
        let upstream = self
            .upstream
            .take()
            .ok_or_else(|| PiperError::Upstream("upstream not connected".to_string()))?;
        let user = self.mapped_user();
        info!(user = %user, "upstream accepted authentication");
        Ok(Step::Done(BridgeOutcome::Authenticated { upstream, user }))
    }

    async fn await_upstream_reply(&mut self, forwarded: Forwarded) -> PiperResult<Step> {
        loop {
            let packet = self.upstream_mut()?.read_packet().await?;
            match packet[0] {
                b if b == MessageType::UserauthSuccess as u8 => {
                    if let Some((algorithm, public_key)) = &forwarded.query {
                        // Success reaches the downstream only after it signs.
                        debug!("upstream accepts none; waiting for a signature");
                        self.held_success = Some(packet);
                        self.send_pk_ok(algorithm, public_key).await?;
                        return Ok(Step::NextRequest);
                    }
                    return self.complete(packet).await;
                }
                b if b == MessageType::UserauthFailure as u8 => {
                    let failure = AuthFailure::from_bytes(&packet)?;
                    debug!(
                        methods = ?failure.methods_can_continue(),
                        partial = failure.partial_success(),
                        "upstream refused"
                    );
                    self.upstream_methods = Some(failure.methods_can_continue().to_vec());
                    if forwarded.verbatim_failure {
                        self.downstream.write_packet(&packet).await?;
                    } else {
                        let methods = self.allowed_methods();
                        send_failure(self.downstream, methods, failure.partial_success()).await?;
                    }
                    return Ok(Step::NextRequest);
                }
                b if b == MessageType::UserauthBanner as u8 => {
                    self.downstream.write_packet(&packet).await?;
                }
                USERAUTH_INFO_REQUEST if forwarded.keyboard_interactive => {
                    self.downstream.write_packet(&packet).await?;
                    self.enter(BridgeState::RepromptDownstream);
                    let response = read_info_response(self.downstream).await?;
                    self.upstream_mut()?.write_packet(&response).await?;
                    self.enter(BridgeState::AwaitUpstreamReply);
                }
                b if b == MessageType::Ignore as u8 || b == MessageType::Debug as u8 => {}
                b if b == MessageType::Disconnect as u8 => {
                    return Err(Disconnect::from_bytes(&packet)?.into_error());
                }
                other => {
                    return Err(PiperError::Protocol(format!(
                        "unexpected {} from upstream during authentication",
                        message_name(other)
                    )));
                }
            }
        }
    }
}

async fn send_failure(
    downstream: &HalfTransport,
    methods: Vec<String>,
    partial_success: bool,
) -> PiperResult<()> {
    downstream
        .write_packet(&AuthFailure::new(methods, partial_success).to_bytes())
        .await
}

/// Builds a publickey method signed by `signer` over the upstream session.
fn sign_again(
    signer: &Arc<PrivateKey>,
    session_id: &[u8],
    user: &str,
    service: &str,
) -> PiperResult<AuthMethod> {
    let algorithm = signer
        .signature_algorithms()
        .first()
        .copied()
        .ok_or_else(|| {
            PiperError::Auth(format!("{} key has no signature algorithm", signer.key_type()))
        })?;
    let public_key = signer.public_key().to_blob();
    let data = construct_signature_data(session_id, user, service, algorithm, &public_key);
    let signature = signer.sign(algorithm, &data)?;
    Ok(AuthMethod::PublicKey {
        algorithm: algorithm.to_string(),
        public_key,
        signature: Some(signature),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::SERVICE_CONNECTION;

    #[test]
    fn test_sign_again_covers_upstream_session() {
        let signer = Arc::new(PrivateKey::generate_ed25519());
        let session_id = [7u8; 32];
        let method = sign_again(&signer, &session_id, "bob", SERVICE_CONNECTION).unwrap();
        let AuthMethod::PublicKey {
            algorithm,
            public_key,
            signature,
        } = method
        else {
            panic!("expected publickey method");
        };
        assert_eq!(algorithm, "ssh-ed25519");
        let data = construct_signature_data(
            &session_id,
            "bob",
            SERVICE_CONNECTION,
            &algorithm,
            &public_key,
        );
        let key = PublicKey::from_blob(&public_key).unwrap();
        assert!(key.verify(&algorithm, &data, signature.as_ref().unwrap()));

        let other_session = construct_signature_data(
            &[8u8; 32],
            "bob",
            SERVICE_CONNECTION,
            &algorithm,
            &public_key,
        );
        assert!(!key.verify(&algorithm, &other_session, signature.as_ref().unwrap()));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(BridgeState::AwaitDownstreamReq.to_string(), "await-downstream-req");
        assert_eq!(BridgeState::RepromptDownstream.to_string(), "reprompt-downstream");
    }
}
