//! Host key loading and generation.

use crate::config::HostKeyGenerate;
use anyhow::{bail, Context, Result};
use piper_proto::ssh::PrivateKey;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Loads the configured host keys, generating an ed25519 key as `mode` says.
///
/// # Arguments
///
/// * `paths` - key files; a generated key is written to the first one
/// * `mode` - [`HostKeyGenerate::NotExist`] generates only when none of
///   `paths` exists, [`HostKeyGenerate::Always`] replaces the first file on
///   every call
///
/// # Errors
///
/// Fails when a present file cannot be parsed, when a generated key cannot
/// be written, or when no key is left at the end.
pub fn load_host_keys(paths: &[PathBuf], mode: HostKeyGenerate) -> Result<Vec<PrivateKey>> {
    let mut keys = Vec::new();

    if mode == HostKeyGenerate::Always {
        let path = paths.first().context("no host key path to write a generated key to")?;
        keys.push(generate_to(path)?);
    }

    for path in paths.iter().skip(keys.len()) {
        if !path.exists() {
            warn!(path = %path.display(), "host key file not found");
            continue;
        }
        let key = PrivateKey::from_file(path)
            .with_context(|| format!("loading host key: {}", path.display()))?;
        info!(path = %path.display(), key = ?key, "loaded host key");
        keys.push(key);
    }

    if keys.is_empty() && mode == HostKeyGenerate::NotExist {
        if let Some(path) = paths.first() {
            keys.push(generate_to(path)?);
        }
    }

    if keys.is_empty() {
        bail!("no host keys available");
    }
    Ok(keys)
}

fn generate_to(path: &Path) -> Result<PrivateKey> {
    let key = PrivateKey::generate_ed25519();
    save_host_key(&key, path)?;
    info!(path = %path.display(), key = ?key, "generated host key");
    Ok(key)
}

fn save_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory: {}", parent.display()))?;
        }
    }

    let text = zeroize::Zeroizing::new(key.to_openssh("piperd")?);

    // Restrictive permissions from the start
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("creating host key file: {}", path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, text.as_bytes())
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }

    Ok(())
}
