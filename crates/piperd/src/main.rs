use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use piperd::cli::{Cli, Command};
use piperd::{config, daemon, logging, routes};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_config(&cli.config)?;
    cli.apply_overrides(&mut cfg);
    config::validate_config(&cfg)?;

    if cli.command == Some(Command::CheckConfig) {
        let router = routes::build_router(&cfg)?;
        let pipe = daemon::pipe_config(&cfg, Vec::new())?;
        println!("Configuration is valid.");
        println!("  Listen: {}", cfg.server.listen);
        println!("  Server version: {}", pipe.server_version);
        println!("  Host keys: {}", cfg.server.host_keys.len());
        println!("  Routes: {}", cfg.routes.len());
        if let Some(fixed) = &cfg.fixed {
            println!("  Fixed target: {}:{}", fixed.host, fixed.port);
        }
        println!("  Routers in chain: {}", router.len());
        println!("  Downstream hooks: {}", daemon::describe_hooks(&pipe.downstream_hooks));
        println!("  Upstream hooks: {}", daemon::describe_hooks(&pipe.upstream_hooks));
        println!("  PROXY protocol: {}", cfg.proxy_protocol.enabled);
        return Ok(());
    }

    logging::init_logging(&cfg.logging.level, cfg.logging.format)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let shutdown = CancellationToken::new();
        daemon::cancel_on_ctrl_c(shutdown.clone());
        if let Err(e) = daemon::run(cfg, shutdown).await {
            error!(error = %e, "piperd failed");
            return Err(e);
        }
        Ok(())
    })
}
