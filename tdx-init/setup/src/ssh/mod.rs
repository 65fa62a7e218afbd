//! Operator SSH key provisioning.
//!
//! A key delivered once is kept in a LUKS token on the `store_at` disk, so
//! later boots pick it up without waiting on the operator again.

pub mod handshake;

pub use handshake::{KeyHandshake, NetworkHandshake, handshake_for, is_valid_key};

use anyhow::{Context, Result, anyhow};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::SshConfig;
use crate::crypto::ssh_fingerprint;
use crate::disks::{DiskManager, luks};

const AUTHORIZED_KEYS: &str = "authorized_keys";
const KEY_OPTIONS: &str = "no-port-forwarding,no-agent-forwarding,no-X11-forwarding";

pub struct SshManager {
    config: SshConfig,
    handshake: Box<dyn KeyHandshake>,
}

impl SshManager {
    pub fn new(config: &SshConfig) -> Result<Self> {
        let handshake = handshake_for(config).context("failed to create SSH key handshake")?;
        Ok(Self::with_handshake(config, handshake))
    }

    pub fn with_handshake(config: &SshConfig, handshake: Box<dyn KeyHandshake>) -> Self {
        Self {
            config: config.clone(),
            handshake,
        }
    }

    /// Obtain the key (stored token first, then the handshake) and install it.
    pub async fn setup(&self, disks: &DiskManager, cancel: &CancellationToken) -> Result<()> {
        let stored = match &self.config.store_at {
            Some(disk) => match stored_key(disks, disk) {
                Ok(key) => {
                    log::info!("retrieved SSH key from disk {disk}");
                    Some(key)
                }
                Err(e) => {
                    log::info!("no stored SSH key found: {e:#}");
                    None
                }
            },
            None => None,
        };

        let key = match stored {
            Some(key) => key,
            None => {
                let key = self
                    .handshake
                    .wait_for_key(cancel)
                    .await
                    .context("failed to get SSH key")?;
                if let Some(disk) = &self.config.store_at {
                    match store_key(disks, disk, &key) {
                        Ok(()) => log::info!("stored SSH key in disk {disk}"),
                        Err(e) => log::warn!("failed to store SSH key in disk {disk}: {e:#}"),
                    }
                }
                key
            }
        };

        match ssh_fingerprint(&key) {
            Ok(fingerprint) => log::info!("installing SSH key {fingerprint}"),
            Err(e) => log::warn!("could not fingerprint SSH key: {e:#}"),
        }
        self.write_key(&key).context("failed to write SSH key")?;

        log::info!("SSH setup completed successfully");
        Ok(())
    }

    fn write_key(&self, key: &str) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.config.dir)
            .context("failed to create SSH directory")?;
        fs::set_permissions(&self.config.dir, Permissions::from_mode(0o700))
            .context("failed to restrict SSH directory")?;

        let authorized_keys = self.config.dir.join(AUTHORIZED_KEYS);
        let entry = format!("{KEY_OPTIONS} ssh-ed25519 {key}\n");
        write_private(&authorized_keys, entry.as_bytes())
            .context("failed to write authorized_keys")?;

        if let Some(key_path) = &self.config.key_path {
            write_private(key_path, key.as_bytes()).context("failed to write key file")?;
        }

        log::info!("SSH key written to {}", authorized_keys.display());
        Ok(())
    }
}

fn token_device<'a>(disks: &'a DiskManager, name: &str) -> Result<&'a Path> {
    let disk = disks
        .disk(name)
        .ok_or_else(|| anyhow!("disk {name} not found"))?;
    disk.device_path
        .as_deref()
        .ok_or_else(|| anyhow!("disk {name} not yet initialized"))
}

fn stored_key(disks: &DiskManager, name: &str) -> Result<String> {
    let device = token_device(disks, name)?;
    let key = luks::get_ssh_token(disks.backend(), device)?;
    if !is_valid_key(&key) {
        return Err(anyhow!("stored SSH key has an invalid format"));
    }
    Ok(key)
}

fn store_key(disks: &DiskManager, name: &str, key: &str) -> Result<()> {
    let device = token_device(disks, name)?;
    luks::store_ssh_token(disks.backend(), device, key)
}

/// Write `contents` to `path`, readable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    // `mode` only applies when the file is created.
    fs::set_permissions(path, Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    Ok(())
}
