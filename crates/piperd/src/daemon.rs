//! Daemon wiring: config to pipe settings, listener, shutdown.

use crate::config::PiperdConfig;
use crate::hostkeys::load_host_keys;
use crate::routes::build_router;
use anyhow::{Context, Result};
use piper_proto::ssh::piper::{
    DropHostkeysMessage, HookChain, PipeConfig, ProxyProtocolConfig, ReplyPing, Supervisor,
};
use piper_proto::ssh::PrivateKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds the settings every pipe shares.
pub fn pipe_config(config: &PiperdConfig, host_keys: Vec<PrivateKey>) -> Result<PipeConfig> {
    let mut pipe = PipeConfig::new(host_keys);
    pipe.login_grace_time = Duration::from_secs(config.server.login_grace_time_secs);
    pipe.server_version = config.server.version()?;

    if config.server.drop_hostkeys_message {
        pipe.upstream_hooks.push(Arc::new(DropHostkeysMessage));
    }
    if config.server.reply_ping {
        pipe.downstream_hooks.push(Arc::new(ReplyPing));
    }

    if config.proxy_protocol.enabled {
        let mut proxy = ProxyProtocolConfig::new(config.proxy_protocol.networks()?);
        proxy.header_timeout = Duration::from_millis(config.proxy_protocol.header_timeout_ms);
        pipe.proxy_protocol = Some(proxy);
    }
    Ok(pipe)
}

/// Cancels `shutdown` on Ctrl-C.
pub fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C, shutting down"),
        }
        shutdown.cancel();
    });
}

/// Runs the proxy until `shutdown` is cancelled.
///
/// Host keys and routing files are loaded once, before the listener binds.
///
/// # Errors
///
/// Fails when keys or routes cannot be loaded or the listen address cannot
/// be bound.
pub async fn run(config: PiperdConfig, shutdown: CancellationToken) -> Result<()> {
    let host_keys = load_host_keys(&config.server.host_keys, config.server.host_key_generate)?;
    let router = build_router(&config)?;
    let pipe = pipe_config(&config, host_keys)?;

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(
        version = %pipe.server_version,
        routers = router.len(),
        downstream_hooks = %describe_hooks(&pipe.downstream_hooks),
        upstream_hooks = %describe_hooks(&pipe.upstream_hooks),
        proxy_protocol = pipe.proxy_protocol.is_some(),
        "piperd starting"
    );

    let supervisor = Supervisor::new(pipe, router);
    supervisor.serve(listener, shutdown).await?;

    info!(active_pipes = supervisor.active_pipes(), "piperd stopped");
    Ok(())
}

/// Hook chain summary for logs and `check-config` output.
pub fn describe_hooks(chain: &HookChain) -> String {
    if chain.is_empty() {
        "none".to_string()
    } else {
        format!("{:?}", chain)
    }
}
