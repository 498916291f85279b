//! TOML configuration.

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use piper_proto::ssh::Version;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Maximum config file size (1 MiB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// When to generate an ed25519 host key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyGenerate {
    /// Never; at least one configured key must exist
    Disable,
    /// When none of the configured keys exists
    #[default]
    NotExist,
    /// On every start, replacing the first configured key
    Always,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PiperdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy_protocol: ProxyProtocolSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub fixed: Option<FixedRoute>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_login_grace_time")]
    pub login_grace_time_secs: u64,
    #[serde(default = "default_server_version")]
    pub server_version: String,
    #[serde(default = "default_host_keys")]
    pub host_keys: Vec<PathBuf>,
    #[serde(default)]
    pub host_key_generate: HostKeyGenerate,
    #[serde(default)]
    pub drop_hostkeys_message: bool,
    #[serde(default)]
    pub reply_ping: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            login_grace_time_secs: default_login_grace_time(),
            server_version: default_server_version(),
            host_keys: default_host_keys(),
            host_key_generate: HostKeyGenerate::default(),
            drop_hostkeys_message: false,
            reply_ping: false,
        }
    }
}

impl ServerConfig {
    /// Parsed `server_version`.
    pub fn version(&self) -> Result<Version> {
        Version::parse(&self.server_version).context("server.server_version")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyProtocolSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    #[serde(default = "default_header_timeout")]
    pub header_timeout_ms: u64,
}

impl Default for ProxyProtocolSection {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_sources: Vec::new(),
            header_timeout_ms: default_header_timeout(),
        }
    }
}

impl ProxyProtocolSection {
    /// Parsed `allowed_sources`.
    pub fn networks(&self) -> Result<Vec<IpNet>> {
        self.allowed_sources
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNet>().with_context(|| {
                    format!("invalid CIDR in proxy_protocol.allowed_sources: {}", cidr)
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Upstream host key check, shared by `[fixed]` and `[[route]]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostKeyCheck {
    /// known_hosts file to match the upstream key against
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    /// Expected key as an OpenSSH public key line
    #[serde(default)]
    pub host_key: Option<String>,
    /// Accept any upstream key
    #[serde(default)]
    pub ignore_hostkey: bool,
}

impl HostKeyCheck {
    fn configured(&self) -> usize {
        usize::from(self.known_hosts.is_some())
            + usize::from(self.host_key.is_some())
            + usize::from(self.ignore_hostkey)
    }
}

/// Every user goes to one upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct FixedRoute {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(flatten)]
    pub host_key: HostKeyCheck,
}

/// One `[[route]]` rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    /// Downstream user name, or `*`
    pub from: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Upstream user; empty keeps the downstream user
    #[serde(default)]
    pub user: String,
    /// Key to sign with upstream
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Password to send upstream
    #[serde(default)]
    pub password: Option<String>,
    /// Password the downstream must present to use this rule
    #[serde(default)]
    pub downstream_password: Option<String>,
    /// Downstream keys allowed to use this rule
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,
    /// CA keys trusted for downstream user certificates
    #[serde(default)]
    pub trusted_user_ca_keys: Option<PathBuf>,
    #[serde(flatten)]
    pub host_key: HostKeyCheck,
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_login_grace_time() -> u64 {
    30
}

fn default_server_version() -> String {
    piper_proto::ssh::version::DEFAULT_IDENTIFICATION.to_string()
}

fn default_host_keys() -> Vec<PathBuf> {
    vec![PathBuf::from("/etc/ssh/ssh_host_ed25519_key")]
}

fn default_header_timeout() -> u64 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<PiperdConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// On Unix, warn if the config file is readable by group or others; it may
/// hold upstream passwords.
#[cfg(unix)]
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:04o}", mode & 0o7777),
                    "config file is readable by group/others, consider 0600"
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "could not check config file permissions"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_file_permissions(_path: &Path) {}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<PiperdConfig> {
    let config: PiperdConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
pub fn validate_config(config: &PiperdConfig) -> Result<()> {
    if config.server.listen.trim().is_empty() {
        bail!("server.listen must not be empty");
    }
    config
        .server
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("server.listen is not an address: {}", config.server.listen))?;
    if config.server.login_grace_time_secs == 0 {
        bail!("server.login_grace_time_secs must be greater than 0");
    }
    config.server.version()?;

    let networks = config.proxy_protocol.networks()?;
    if config.proxy_protocol.enabled && networks.is_empty() {
        bail!("proxy_protocol.enabled requires at least one allowed source");
    }

    if config.fixed.is_none() && config.routes.is_empty() {
        bail!("no routing configured: add a [fixed] section or [[route]] rules");
    }
    if let Some(fixed) = &config.fixed {
        validate_target("fixed", &fixed.host, fixed.port, &fixed.host_key)?;
    }
    for (i, rule) in config.routes.iter().enumerate() {
        let name = format!("route[{}] ({})", i, rule.from);
        if rule.from.trim().is_empty() {
            bail!("{}: from must not be empty", name);
        }
        validate_target(&name, &rule.host, rule.port, &rule.host_key)?;
        if rule.password.is_some() && rule.private_key.is_some() {
            bail!("{}: password and private_key are mutually exclusive", name);
        }
        let maps_credentials = rule.password.is_some() || rule.private_key.is_some();
        let checks_downstream = rule.downstream_password.is_some()
            || rule.authorized_keys.is_some()
            || rule.trusted_user_ca_keys.is_some();
        if maps_credentials && !checks_downstream {
            bail!(
                "{}: password or private_key needs downstream_password, \
                 authorized_keys or trusted_user_ca_keys",
                name
            );
        }
    }
    Ok(())
}

fn validate_target(name: &str, host: &str, port: u16, check: &HostKeyCheck) -> Result<()> {
    if host.trim().is_empty() {
        bail!("{}: host must not be empty", name);
    }
    if port == 0 {
        bail!("{}: port must not be 0", name);
    }
    match check.configured() {
        0 => bail!("{}: set one of known_hosts, host_key or ignore_hostkey", name),
        1 => Ok(()),
        _ => bail!("{}: known_hosts, host_key and ignore_hostkey are mutually exclusive", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[fixed]
host = "10.0.0.5"
ignore_hostkey = true
"#;

    #[test]
    fn test_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:2222");
        assert_eq!(config.server.login_grace_time_secs, 30);
        assert_eq!(config.server.server_version, "SSH-2.0-SSHPiper");
        assert_eq!(config.server.host_key_generate, HostKeyGenerate::NotExist);
        assert_eq!(config.proxy_protocol.header_timeout_ms, 200);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.fixed.unwrap().port, 22);
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
[server]
listen = "127.0.0.1:2200"
login_grace_time_secs = 5
host_keys = ["/keys/a", "/keys/b"]
host_key_generate = "always"
drop_hostkeys_message = true
reply_ping = true

[proxy_protocol]
enabled = true
allowed_sources = ["10.0.0.0/8", "::1/128"]

[logging]
level = "debug"
format = "json"

[[route]]
from = "alice"
host = "backend"
port = 2022
user = "bob"
private_key = "/keys/upstream"
authorized_keys = "/keys/alice.pub"
known_hosts = "/keys/known_hosts"

[[route]]
from = "*"
host = "fallback"
ignore_hostkey = true
"#,
        )
        .unwrap();
        assert_eq!(config.server.host_key_generate, HostKeyGenerate::Always);
        assert_eq!(config.proxy_protocol.networks().unwrap().len(), 2);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].user, "bob");
        assert!(config.routes[1].user.is_empty());
        assert!(config.routes[1].host_key.ignore_hostkey);
    }

    #[test]
    fn test_rejects_invalid() {
        // no routing
        assert!(parse_config("[server]\nlisten = \"0.0.0.0:22\"\n").is_err());
        // no host key check
        assert!(parse_config("[fixed]\nhost = \"a\"\n").is_err());
        // two host key checks
        let both = "[fixed]\nhost = \"a\"\nignore_hostkey = true\n\
                    host_key = \"ssh-ed25519 AAAA\"\n";
        assert!(parse_config(both).is_err());
        // zero grace
        let zero_grace = format!("[server]\nlogin_grace_time_secs = 0\n{}", MINIMAL);
        assert!(parse_config(&zero_grace).is_err());
        // bad CIDR
        let bad_cidr = format!(
            "[proxy_protocol]\nallowed_sources = [\"10.0.0.0/99\"]\n{}",
            MINIMAL
        );
        assert!(parse_config(&bad_cidr).is_err());
        // unknown key
        assert!(parse_config(&format!("[server]\nlisten_addr = \"x\"\n{}", MINIMAL)).is_err());
        // bad listen
        assert!(parse_config(&format!("[server]\nlisten = \"nope\"\n{}", MINIMAL)).is_err());
        // upstream secret with nothing checked downstream
        assert!(parse_config(
            "[[route]]\nfrom = \"a\"\nhost = \"b\"\npassword = \"x\"\nignore_hostkey = true\n"
        )
        .is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert!(config.fixed.is_some());
    }

    #[test]
    fn test_load_config_too_large() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![b'#'; MAX_CONFIG_SIZE as usize + 1]).unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
