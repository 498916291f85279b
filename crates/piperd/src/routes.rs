//! Config-driven routers.
//!
//! `[[route]]` rules become a [`TableRouter`], `[fixed]` a [`FixedRouter`];
//! [`build_router`] chains them with the table first, so a user no rule
//! matches falls through to the fixed upstream (or is rejected when there is
//! none).

use crate::config::{FixedRoute, HostKeyCheck, PiperdConfig, RouteRule};
use anyhow::{Context, Result};
use piper_platform::{PiperError, PiperResult};
use piper_proto::ssh::certificate::is_certificate_algorithm;
use piper_proto::ssh::piper::{
    AuthAttempt, AuthDecision, ChainRouter, ConnectionMeta, Decision, DownstreamPrompter,
    HostKeyPolicy, Router, Upstream,
};
use piper_proto::ssh::{AuthorizedKeys, InfoRequest, PrivateKey, Prompt, PublicKey};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const PUBLICKEY: &str = "publickey";
const PASSWORD: &str = "password";
const KEYBOARD_INTERACTIVE: &str = "keyboard-interactive";

/// Per-connection routing state.
#[derive(Debug, Clone)]
pub struct RouteContext {
    /// Downstream user
    pub user: String,
    /// Client address
    pub remote_addr: SocketAddr,
    /// Index of the matching rule
    pub rule: Option<usize>,
}

impl RouteContext {
    fn new(meta: &ConnectionMeta) -> Self {
        Self {
            user: meta.user.clone(),
            remote_addr: meta.remote_addr,
            rule: None,
        }
    }
}

fn host_key_policy(check: &HostKeyCheck) -> Result<HostKeyPolicy> {
    if check.ignore_hostkey {
        return Ok(HostKeyPolicy::Ignore);
    }
    if let Some(path) = &check.known_hosts {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading known_hosts: {}", path.display()))?;
        return Ok(HostKeyPolicy::KnownHosts(content));
    }
    if let Some(line) = &check.host_key {
        let key = PublicKey::from_openssh(line).context("parsing host_key")?;
        return Ok(HostKeyPolicy::Fixed(key.to_blob()));
    }
    Ok(HostKeyPolicy::Router)
}

/// Routes every user to one upstream, passing credentials through.
pub struct FixedRouter {
    upstream: Upstream,
}

impl FixedRouter {
    /// Builds the router from `[fixed]`.
    pub fn from_config(fixed: &FixedRoute) -> Result<Self> {
        let upstream = Upstream::new(fixed.host.clone(), fixed.port)
            .with_host_key(host_key_policy(&fixed.host_key)?);
        Ok(Self { upstream })
    }

    fn passthrough(&self) -> PiperResult<Decision> {
        Ok(Decision::new(AuthDecision::Passthrough).via(self.upstream.clone()))
    }
}

#[async_trait::async_trait]
impl Router for FixedRouter {
    type Context = RouteContext;

    async fn new_context(&self, meta: &ConnectionMeta) -> PiperResult<RouteContext> {
        Ok(RouteContext::new(meta))
    }

    fn supported_methods(&self, _ctx: &RouteContext) -> Vec<String> {
        vec![
            PUBLICKEY.to_string(),
            PASSWORD.to_string(),
            KEYBOARD_INTERACTIVE.to_string(),
        ]
    }

    async fn on_password(
        &self,
        _ctx: &mut RouteContext,
        _password: &[u8],
    ) -> PiperResult<Decision> {
        self.passthrough()
    }

    async fn on_publickey(
        &self,
        _ctx: &mut RouteContext,
        _algorithm: &str,
        _public_key: &[u8],
        _verified: bool,
    ) -> PiperResult<Decision> {
        self.passthrough()
    }

    async fn on_keyboard_interactive(
        &self,
        _ctx: &mut RouteContext,
        _prompter: &mut dyn DownstreamPrompter,
    ) -> PiperResult<Decision> {
        self.passthrough()
    }

    async fn on_auth_success(&self, ctx: &mut RouteContext) {
        info!(user = %ctx.user, upstream = %self.upstream.address(), "routed by fixed target");
    }
}

/// What the proxy presents upstream.
enum UpstreamAuth {
    Passthrough,
    Password(Zeroizing<Vec<u8>>),
    PrivateKey(Arc<PrivateKey>),
}

/// A `[[route]]` rule with its files loaded.
struct CompiledRule {
    from: String,
    upstream: Upstream,
    auth: UpstreamAuth,
    downstream_password: Option<Zeroizing<String>>,
    authorized_keys: Option<AuthorizedKeys>,
    trusted_ca_keys: Vec<Vec<u8>>,
}

impl CompiledRule {
    fn compile(rule: &RouteRule) -> Result<Self> {
        let name = &rule.from;
        let policy = host_key_policy(&rule.host_key).with_context(|| format!("route {}", name))?;
        let upstream = Upstream::new(rule.host.clone(), rule.port)
            .with_user(rule.user.clone())
            .with_host_key(policy);

        let auth = match (&rule.password, &rule.private_key) {
            (Some(password), _) => {
                UpstreamAuth::Password(Zeroizing::new(password.as_bytes().to_vec()))
            }
            (None, Some(path)) => UpstreamAuth::PrivateKey(Arc::new(
                PrivateKey::from_file(path).with_context(|| {
                    format!("route {}: loading private_key {}", name, path.display())
                })?,
            )),
            (None, None) => UpstreamAuth::Passthrough,
        };

        let authorized_keys = match &rule.authorized_keys {
            Some(path) => Some(
                AuthorizedKeys::from_file(path).with_context(|| {
                    format!("route {}: loading authorized_keys {}", name, path.display())
                })?,
            ),
            None => None,
        };

        let mut trusted_ca_keys = match &rule.trusted_user_ca_keys {
            Some(path) => {
                let content = std::fs::read_to_string(path).with_context(|| {
                    format!("route {}: reading trusted_user_ca_keys {}", name, path.display())
                })?;
                parse_ca_keys(&content)
                    .with_context(|| format!("route {}: trusted_user_ca_keys", name))?
            }
            None => Vec::new(),
        };
        if let Some(keys) = &authorized_keys {
            trusted_ca_keys.extend(keys.cert_authorities());
        }

        Ok(Self {
            from: rule.from.clone(),
            upstream,
            auth,
            downstream_password: rule.downstream_password.clone().map(Zeroizing::new),
            authorized_keys,
            trusted_ca_keys,
        })
    }

    fn matches(&self, user: &str) -> bool {
        self.from == "*" || self.from == user
    }

    fn accepts_keys(&self) -> bool {
        self.authorized_keys.is_some() || !self.trusted_ca_keys.is_empty()
    }

    fn accepts_secret(&self) -> bool {
        self.downstream_password.is_some() || matches!(self.auth, UpstreamAuth::Passthrough)
    }

    fn methods(&self) -> Vec<String> {
        let mut methods = Vec::new();
        if self.accepts_keys() {
            methods.push(PUBLICKEY.to_string());
        }
        if self.accepts_secret() {
            methods.push(PASSWORD.to_string());
            methods.push(KEYBOARD_INTERACTIVE.to_string());
        }
        methods
    }

    /// Decision after the downstream proved who it is.
    fn mapped(&self) -> Decision {
        let action = match &self.auth {
            UpstreamAuth::Passthrough => AuthDecision::Passthrough,
            UpstreamAuth::Password(password) => AuthDecision::MapToPassword(password.clone()),
            UpstreamAuth::PrivateKey(key) => AuthDecision::MapToPrivateKey(key.clone()),
        };
        Decision::new(action).via(self.upstream.clone())
    }

    fn password_matches(&self, password: &[u8]) -> bool {
        match &self.downstream_password {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(password)),
            None => false,
        }
    }

    fn key_allowed(&self, algorithm: &str, public_key: &[u8]) -> bool {
        // Certificates reach the router only after CA validation.
        if is_certificate_algorithm(algorithm) {
            return !self.trusted_ca_keys.is_empty();
        }
        self.authorized_keys
            .as_ref()
            .map(|keys| keys.contains(public_key))
            .unwrap_or(false)
    }
}

fn parse_ca_keys(content: &str) -> Result<Vec<Vec<u8>>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            PublicKey::from_openssh(line)
                .map(|key| key.to_blob())
                .map_err(anyhow::Error::from)
        })
        .collect()
}

fn discard() -> PiperResult<Decision> {
    Ok(Decision::new(AuthDecision::Discard))
}

/// Routes users by `[[route]]` rules, first match wins.
///
/// Users without a matching rule are delegated to the next router.
pub struct TableRouter {
    rules: Vec<CompiledRule>,
}

impl TableRouter {
    /// Loads every file the rules reference.
    ///
    /// # Errors
    ///
    /// Fails on the first unreadable or unparsable file.
    pub fn from_config(rules: &[RouteRule]) -> Result<Self> {
        let rules = rules.iter().map(CompiledRule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn rule(&self, ctx: &RouteContext) -> Option<&CompiledRule> {
        ctx.rule.and_then(|index| self.rules.get(index))
    }
}

#[async_trait::async_trait]
impl Router for TableRouter {
    type Context = RouteContext;

    async fn new_context(&self, meta: &ConnectionMeta) -> PiperResult<RouteContext> {
        let mut ctx = RouteContext::new(meta);
        ctx.rule = self.rules.iter().position(|rule| rule.matches(&meta.user));
        match self.rule(&ctx) {
            Some(rule) => debug!(
                user = %meta.user,
                from = %rule.from,
                upstream = %rule.upstream.address(),
                "route matched"
            ),
            None => debug!(user = %meta.user, "no route matched"),
        }
        Ok(ctx)
    }

    fn supported_methods(&self, ctx: &RouteContext) -> Vec<String> {
        match self.rule(ctx) {
            Some(rule) => rule.methods(),
            // Every method reaches decide() and is delegated.
            None => vec![
                PUBLICKEY.to_string(),
                PASSWORD.to_string(),
                KEYBOARD_INTERACTIVE.to_string(),
            ],
        }
    }

    fn trusted_user_ca_keys(&self, ctx: &RouteContext) -> Vec<Vec<u8>> {
        self.rule(ctx)
            .map(|rule| rule.trusted_ca_keys.clone())
            .unwrap_or_default()
    }

    async fn on_password(&self, ctx: &mut RouteContext, password: &[u8]) -> PiperResult<Decision> {
        let Some(rule) = self.rule(ctx) else {
            return discard();
        };
        if rule.downstream_password.is_some() {
            if !rule.password_matches(password) {
                warn!(
                    user = %ctx.user,
                    remote_addr = %ctx.remote_addr,
                    "wrong downstream password"
                );
                return discard();
            }
            return Ok(rule.mapped());
        }
        match rule.auth {
            UpstreamAuth::Passthrough => Ok(rule.mapped()),
            _ => discard(),
        }
    }

    async fn on_publickey_query(
        &self,
        ctx: &mut RouteContext,
        algorithm: &str,
        public_key: &[u8],
    ) -> PiperResult<Decision> {
        let Some(rule) = self.rule(ctx) else {
            return discard();
        };
        if !rule.key_allowed(algorithm, public_key) {
            return discard();
        }
        let decision = rule.mapped();
        match decision.action {
            AuthDecision::MapToPrivateKey(_) | AuthDecision::Passthrough => Ok(decision),
            _ => discard(),
        }
    }

    async fn on_publickey(
        &self,
        ctx: &mut RouteContext,
        algorithm: &str,
        public_key: &[u8],
        verified: bool,
    ) -> PiperResult<Decision> {
        let Some(rule) = self.rule(ctx) else {
            return discard();
        };
        if !verified || !rule.key_allowed(algorithm, public_key) {
            debug!(user = %ctx.user, algorithm, "key not authorized for route");
            return discard();
        }
        Ok(rule.mapped())
    }

    async fn on_keyboard_interactive(
        &self,
        ctx: &mut RouteContext,
        prompter: &mut dyn DownstreamPrompter,
    ) -> PiperResult<Decision> {
        let Some(rule) = self.rule(ctx) else {
            return discard();
        };
        if rule.downstream_password.is_none() {
            return match rule.auth {
                UpstreamAuth::Passthrough => Ok(rule.mapped()),
                _ => discard(),
            };
        }

        let request = InfoRequest {
            name: String::new(),
            instruction: String::new(),
            prompts: vec![Prompt {
                prompt: "Password: ".to_string(),
                echo: false,
            }],
        };
        let answers = prompter.prompt(request).await?;
        let Some(answer) = answers.first() else {
            return Err(PiperError::Auth("empty keyboard-interactive answer".to_string()));
        };
        if !rule.password_matches(answer.as_bytes()) {
            warn!(user = %ctx.user, remote_addr = %ctx.remote_addr, "wrong downstream password");
            return discard();
        }
        // Passthrough would replay keyboard-interactive upstream and ask again.
        match rule.mapped() {
            Decision {
                action: AuthDecision::Passthrough,
                upstream,
            } => Ok(Decision {
                action: AuthDecision::MapToNone,
                upstream,
            }),
            decision => Ok(decision),
        }
    }

    async fn on_auth_success(&self, ctx: &mut RouteContext) {
        if let Some(rule) = self.rule(ctx) {
            info!(
                user = %ctx.user,
                from = %rule.from,
                upstream = %rule.upstream.address(),
                "routed by rule"
            );
        }
    }
}

/// One of the config-driven routers, so both fit in one chain.
pub enum RouteBackend {
    /// `[[route]]` rules
    Table(TableRouter),
    /// `[fixed]`
    Fixed(FixedRouter),
}

#[async_trait::async_trait]
impl Router for RouteBackend {
    type Context = RouteContext;

    async fn new_context(&self, meta: &ConnectionMeta) -> PiperResult<RouteContext> {
        match self {
            RouteBackend::Table(router) => router.new_context(meta).await,
            RouteBackend::Fixed(router) => router.new_context(meta).await,
        }
    }

    fn supported_methods(&self, ctx: &RouteContext) -> Vec<String> {
        match self {
            RouteBackend::Table(router) => router.supported_methods(ctx),
            RouteBackend::Fixed(router) => router.supported_methods(ctx),
        }
    }

    fn trusted_user_ca_keys(&self, ctx: &RouteContext) -> Vec<Vec<u8>> {
        match self {
            RouteBackend::Table(router) => router.trusted_user_ca_keys(ctx),
            RouteBackend::Fixed(router) => router.trusted_user_ca_keys(ctx),
        }
    }

    async fn on_auth_success(&self, ctx: &mut RouteContext) {
        match self {
            RouteBackend::Table(router) => router.on_auth_success(ctx).await,
            RouteBackend::Fixed(router) => router.on_auth_success(ctx).await,
        }
    }

    async fn decide(
        &self,
        ctx: &mut RouteContext,
        attempt: &AuthAttempt,
        prompter: &mut dyn DownstreamPrompter,
    ) -> PiperResult<Decision> {
        match self {
            RouteBackend::Table(router) if router.rule(ctx).is_none() => {
                Ok(Decision::new(AuthDecision::DelegateToNext))
            }
            RouteBackend::Table(router) => router.decide(ctx, attempt, prompter).await,
            RouteBackend::Fixed(router) => router.decide(ctx, attempt, prompter).await,
        }
    }
}

/// Builds the router chain for `config`: rules first, then the fixed target.
///
/// # Errors
///
/// Fails when a referenced file cannot be loaded or nothing is configured.
pub fn build_router(config: &PiperdConfig) -> Result<ChainRouter<RouteBackend>> {
    let mut routers = Vec::new();
    if !config.routes.is_empty() {
        routers.push(RouteBackend::Table(TableRouter::from_config(&config.routes)?));
    }
    if let Some(fixed) = &config.fixed {
        routers.push(RouteBackend::Fixed(FixedRouter::from_config(fixed)?));
    }
    Ok(ChainRouter::new(routers)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::io::Write;

    struct NoPrompts;

    #[async_trait::async_trait]
    impl DownstreamPrompter for NoPrompts {
        async fn prompt(&mut self, _request: InfoRequest) -> PiperResult<Vec<Zeroizing<String>>> {
            Err(PiperError::Protocol("no prompts in this test".to_string()))
        }
    }

    struct Answers(Vec<&'static str>);

    #[async_trait::async_trait]
    impl DownstreamPrompter for Answers {
        async fn prompt(&mut self, request: InfoRequest) -> PiperResult<Vec<Zeroizing<String>>> {
            assert_eq!(request.prompts.len(), 1);
            Ok(self.0.iter().map(|a| Zeroizing::new(a.to_string())).collect())
        }
    }

    fn meta(user: &str) -> ConnectionMeta {
        ConnectionMeta {
            user: user.to_string(),
            remote_addr: "192.0.2.7:50000".parse().unwrap(),
            client_version: "SSH-2.0-test".to_string(),
            session_id: vec![7; 32],
        }
    }

    fn password(p: &str) -> AuthAttempt {
        AuthAttempt::Password(Zeroizing::new(p.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_unmatched_user_falls_through_to_fixed() {
        let config = parse_config(
            r#"
[fixed]
host = "fallback"
port = 2022
ignore_hostkey = true

[[route]]
from = "alice"
host = "backend"
ignore_hostkey = true
"#,
        )
        .unwrap();
        let router = build_router(&config).unwrap();
        assert_eq!(router.len(), 2);

        let mut ctx = router.new_context(&meta("mallory")).await.unwrap();
        let decision = router.decide(&mut ctx, &password("x"), &mut NoPrompts).await.unwrap();
        assert!(matches!(decision.action, AuthDecision::Passthrough));
        assert_eq!(decision.upstream.unwrap().address(), "fallback:2022");
        assert_eq!(ctx.index(), 1);

        let mut ctx = router.new_context(&meta("alice")).await.unwrap();
        let decision = router.decide(&mut ctx, &password("x"), &mut NoPrompts).await.unwrap();
        let upstream = decision.upstream.unwrap();
        assert_eq!(upstream.address(), "backend:22");
        assert_eq!(upstream.host_key, HostKeyPolicy::Ignore);
        assert_eq!(ctx.index(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_user_without_fixed_is_rejected() {
        let config = parse_config(
            r#"
[[route]]
from = "alice"
host = "backend"
ignore_hostkey = true
"#,
        )
        .unwrap();
        let router = build_router(&config).unwrap();
        let mut ctx = router.new_context(&meta("bob")).await.unwrap();
        let decision = router.decide(&mut ctx, &password("x"), &mut NoPrompts).await.unwrap();
        assert!(matches!(decision.action, AuthDecision::Reject { code: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_downstream_password_maps_to_upstream_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("upstream_key");
        std::fs::write(&key_path, PrivateKey::generate_ed25519().to_openssh("t").unwrap()).unwrap();

        let config = parse_config(&format!(
            r#"
[[route]]
from = "alice"
host = "backend"
user = "svc"
private_key = "{}"
downstream_password = "open sesame"
ignore_hostkey = true
"#,
            key_path.display()
        ))
        .unwrap();
        let router = TableRouter::from_config(&config.routes).unwrap();
        let mut ctx = router.new_context(&meta("alice")).await.unwrap();
        assert_eq!(
            router.supported_methods(&ctx),
            vec!["password".to_string(), "keyboard-interactive".to_string()]
        );

        let wrong = router.decide(&mut ctx, &password("guess"), &mut NoPrompts).await.unwrap();
        assert!(matches!(wrong.action, AuthDecision::Discard));

        let right = router
            .decide(&mut ctx, &password("open sesame"), &mut NoPrompts)
            .await
            .unwrap();
        assert!(matches!(right.action, AuthDecision::MapToPrivateKey(_)));
        assert_eq!(right.upstream.unwrap().user, "svc");

        let kbd = AuthAttempt::KeyboardInteractive {
            submethods: String::new(),
        };
        let decision = router
            .decide(&mut ctx, &kbd, &mut Answers(vec!["open sesame"]))
            .await
            .unwrap();
        assert!(matches!(decision.action, AuthDecision::MapToPrivateKey(_)));
    }

    #[tokio::test]
    async fn test_publickey_requires_authorized_key() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = PrivateKey::generate_ed25519().public_key();
        let other = PrivateKey::generate_ed25519().public_key();
        let mut file = std::fs::File::create(dir.path().join("authorized_keys")).unwrap();
        writeln!(file, "# alice laptop").unwrap();
        writeln!(
            file,
            "ssh-ed25519 {} alice@laptop",
            base64_blob(&allowed.to_blob())
        )
        .unwrap();

        let config = parse_config(&format!(
            r#"
[[route]]
from = "*"
host = "backend"
password = "upstream-secret"
authorized_keys = "{}"
ignore_hostkey = true
"#,
            dir.path().join("authorized_keys").display()
        ))
        .unwrap();
        let router = TableRouter::from_config(&config.routes).unwrap();
        let mut ctx = router.new_context(&meta("anyone")).await.unwrap();
        assert_eq!(router.supported_methods(&ctx), vec!["publickey".to_string()]);

        let attempt = |key: &PublicKey| AuthAttempt::PublicKey {
            algorithm: "ssh-ed25519".to_string(),
            public_key: key.to_blob(),
            verified: true,
        };
        let decision = router.decide(&mut ctx, &attempt(&allowed), &mut NoPrompts).await.unwrap();
        assert!(matches!(decision.action, AuthDecision::MapToPassword(_)));

        let decision = router.decide(&mut ctx, &attempt(&other), &mut NoPrompts).await.unwrap();
        assert!(matches!(decision.action, AuthDecision::Discard));

        // A query for a key mapped to a password cannot be answered with PK_OK
        let query = AuthAttempt::PublicKeyQuery {
            algorithm: "ssh-ed25519".to_string(),
            public_key: allowed.to_blob(),
        };
        let decision = router.decide(&mut ctx, &query, &mut NoPrompts).await.unwrap();
        assert!(matches!(decision.action, AuthDecision::Discard));
    }

    #[tokio::test]
    async fn test_passthrough_rule() {
        let config = parse_config(
            r#"
[[route]]
from = "bob"
host = "backend"
ignore_hostkey = true
"#,
        )
        .unwrap();
        let router = TableRouter::from_config(&config.routes).unwrap();
        let mut ctx = router.new_context(&meta("bob")).await.unwrap();
        assert_eq!(
            router.supported_methods(&ctx),
            vec!["password".to_string(), "keyboard-interactive".to_string()]
        );
        let decision = router
            .decide(&mut ctx, &password("anything"), &mut NoPrompts)
            .await
            .unwrap();
        assert!(matches!(decision.action, AuthDecision::Passthrough));
        let kbd = AuthAttempt::KeyboardInteractive {
            submethods: String::new(),
        };
        let decision = router.decide(&mut ctx, &kbd, &mut NoPrompts).await.unwrap();
        assert!(matches!(decision.action, AuthDecision::Passthrough));
    }

    #[test]
    fn test_fixed_host_key_line() {
        let key = PrivateKey::generate_ed25519().public_key();
        let line = format!("ssh-ed25519 {}", base64_blob(&key.to_blob()));
        let check = HostKeyCheck {
            host_key: Some(line),
            ..Default::default()
        };
        assert_eq!(host_key_policy(&check).unwrap(), HostKeyPolicy::Fixed(key.to_blob()));
    }

    fn base64_blob(blob: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(blob)
    }
}
