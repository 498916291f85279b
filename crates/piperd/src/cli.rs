use crate::config::{LogFormat, PiperdConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "piperd", version, about = "Transparent SSH reverse proxy")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "piperd.toml", env = "SSHPIPERD_CONFIG")]
    pub config: PathBuf,

    /// Listen address override (host:port)
    #[arg(long, env = "SSHPIPERD_LISTEN")]
    pub listen: Option<String>,

    /// Log level or filter directive override (trace, debug, info, warn, error)
    #[arg(long, env = "SSHPIPERD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format override
    #[arg(long, value_enum, env = "SSHPIPERD_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Validate the configuration file and the files it references
    CheckConfig,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    pub fn apply_overrides(&self, config: &mut PiperdConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "piperd",
            "--config",
            "/tmp/p.toml",
            "--listen",
            "127.0.0.1:2200",
            "--log-format",
            "json",
            "check-config",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Command::CheckConfig));

        let mut config = PiperdConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.server.listen, "127.0.0.1:2200");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }
}
