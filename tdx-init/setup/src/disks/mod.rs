//! Disk discovery, encryption and mounting.

mod filesystem;
pub mod find;
pub mod luks;

pub use find::{DiskFinder, LargestDiskFinder, PathGlobFinder, finder_for};
pub use luks::{DiskBackend, SystemBackend, Token};

use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{DiskConfig, FormatPolicy};
use crate::keys::KeyManager;
use filesystem::create_mount_dirs;

const ENCRYPTED_DIRS: &[&str] = &["ssh", "data", "logs"];
const PLAIN_DIRS: &[&str] = &["data", "logs"];

/// Runtime state of one configured disk.
#[derive(Debug, Clone)]
pub struct ManagedDisk {
    pub name: String,
    pub config: DiskConfig,
    /// Set once discovery has run.
    pub device_path: Option<PathBuf>,
    pub mapper_name: String,
    pub mapper_device: PathBuf,
    pub initialized: bool,
}

impl ManagedDisk {
    fn new(name: &str, config: &DiskConfig) -> Self {
        let mapper_name = format!("crypt_{name}");
        Self {
            name: name.to_string(),
            config: config.clone(),
            device_path: None,
            mapper_device: Path::new("/dev/mapper").join(&mapper_name),
            mapper_name,
            initialized: false,
        }
    }

    fn encryption_key(&self) -> Option<&str> {
        self.config.encryption_key.as_deref()
    }
}

/// Whether setup should wipe the disk given what is on it now.
pub(crate) fn should_format(
    policy: FormatPolicy,
    has_luks: bool,
    initialized: bool,
    encrypted: bool,
) -> bool {
    match policy {
        FormatPolicy::Always => true,
        FormatPolicy::Never => false,
        FormatPolicy::OnInitialize if has_luks => !initialized,
        FormatPolicy::OnInitialize => encrypted,
    }
}

pub struct DiskManager {
    disks: BTreeMap<String, ManagedDisk>,
    finders: BTreeMap<String, Box<dyn DiskFinder>>,
    backend: Arc<dyn DiskBackend>,
}

impl DiskManager {
    pub fn new(disks: &BTreeMap<String, DiskConfig>, backend: Arc<dyn DiskBackend>) -> Result<Self> {
        let mut managed = BTreeMap::new();
        let mut finders = BTreeMap::new();
        for (name, config) in disks {
            let finder = finder_for(config)
                .with_context(|| format!("failed to create disk finder for {name}"))?;
            finders.insert(name.clone(), finder);
            managed.insert(name.clone(), ManagedDisk::new(name, config));
        }
        Ok(Self {
            disks: managed,
            finders,
            backend,
        })
    }

    /// Replace the discovery strategy of a configured disk.
    pub fn with_finder(mut self, name: &str, finder: Box<dyn DiskFinder>) -> Self {
        if self.disks.contains_key(name) {
            self.finders.insert(name.to_string(), finder);
        }
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.disks.keys().map(String::as_str)
    }

    pub fn disk(&self, name: &str) -> Option<&ManagedDisk> {
        self.disks.get(name)
    }

    pub fn backend(&self) -> &dyn DiskBackend {
        self.backend.as_ref()
    }

    /// Discover the device, then format, recover or mount it.
    pub async fn setup_disk(
        &mut self,
        name: &str,
        keys: &mut KeyManager,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let disk = self
            .disks
            .get_mut(name)
            .ok_or_else(|| anyhow!("disk {name} not found"))?;
        let finder = self
            .finders
            .get(name)
            .ok_or_else(|| anyhow!("disk {name} has no finder"))?;
        let backend = self.backend.as_ref();

        let device = finder
            .find()
            .with_context(|| format!("failed to find device for disk {name}"))?;
        log::info!("setting up disk {name} at device {}", device.display());
        disk.device_path = Some(device.clone());

        let has_luks = backend.is_luks(&device);
        if has_luks {
            disk.initialized = luks::is_initialized(backend, &device);
            log::info!(
                "found existing LUKS container on {} (initialized: {})",
                device.display(),
                disk.initialized
            );
        }

        let encrypted = disk.encryption_key().is_some();
        if should_format(disk.config.format, has_luks, disk.initialized, encrypted) {
            let formatted = if encrypted {
                format_encrypted(backend, disk, &device, keys, cancel).await
            } else {
                format_plain(backend, disk, &device)
            };
            formatted.with_context(|| format!("failed to format disk {name}"))
        } else if has_luks {
            mount_existing(backend, disk, &device, keys, cancel)
                .await
                .with_context(|| format!("failed to mount existing disk {name}"))
        } else if !encrypted {
            log::info!("mounting plain disk {}", device.display());
            backend
                .mount(&device, &disk.config.mount_at)
                .with_context(|| format!("failed to mount plain disk {name}"))?;
            log::info!("mounted plain disk {name}");
            Ok(())
        } else {
            bail!("disk {name} requires formatting but format strategy prevents it")
        }
    }

    pub fn unmount(&self, name: &str) -> Result<()> {
        let disk = self
            .disks
            .get(name)
            .ok_or_else(|| anyhow!("disk {name} not found"))?;
        self.backend.unmount(&disk.config.mount_at)
    }

    pub fn close(&self, name: &str) -> Result<()> {
        let disk = self
            .disks
            .get(name)
            .ok_or_else(|| anyhow!("disk {name} not found"))?;
        self.backend.luks_close(&disk.mapper_name)
    }
}

fn format_plain(backend: &dyn DiskBackend, disk: &mut ManagedDisk, device: &Path) -> Result<()> {
    log::info!("formatting plain disk {}", device.display());
    backend.make_filesystem(device)?;
    backend.mount(device, &disk.config.mount_at)?;

    if let Err(e) = create_mount_dirs(&disk.config.mount_at, PLAIN_DIRS) {
        log::warn!("failed to create subdirectories: {e:#}");
    }

    disk.initialized = true;
    log::info!("formatted and mounted plain disk {}", disk.name);
    Ok(())
}

async fn format_encrypted(
    backend: &dyn DiskBackend,
    disk: &mut ManagedDisk,
    device: &Path,
    keys: &mut KeyManager,
    cancel: &CancellationToken,
) -> Result<()> {
    let key_name = disk.encryption_key().unwrap_or_default().to_string();
    let passphrase = keys
        .get_key(&key_name, cancel)
        .await
        .context("failed to get encryption key")?;

    backend.luks_format(device, &passphrase)?;

    if let Err(e) = luks::store_init_token(backend, device, &disk.name) {
        log::warn!("failed to store init token on {}: {e:#}", device.display());
    }

    backend.luks_open(device, &disk.mapper_name, &passphrase)?;

    let mounted = backend
        .make_filesystem(&disk.mapper_device)
        .and_then(|()| backend.mount(&disk.mapper_device, &disk.config.mount_at));
    if let Err(e) = mounted {
        close_after_failure(backend, &disk.mapper_name);
        return Err(e);
    }

    if let Err(e) = create_mount_dirs(&disk.config.mount_at, ENCRYPTED_DIRS) {
        log::warn!("failed to create subdirectories: {e:#}");
    }

    disk.initialized = true;
    log::info!("formatted and mounted encrypted disk {}", disk.name);
    Ok(())
}

async fn mount_existing(
    backend: &dyn DiskBackend,
    disk: &mut ManagedDisk,
    device: &Path,
    keys: &mut KeyManager,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(key_name) = disk.encryption_key().map(str::to_string) else {
        bail!("encrypted disk {} requires encryption key", disk.name);
    };
    let passphrase = keys
        .get_key(&key_name, cancel)
        .await
        .context("failed to get encryption key")?;

    log::info!("opening existing LUKS device {}", device.display());
    backend.luks_open(device, &disk.mapper_name, &passphrase)?;

    if let Err(e) = backend.mount(&disk.mapper_device, &disk.config.mount_at) {
        close_after_failure(backend, &disk.mapper_name);
        return Err(e);
    }

    log::info!("mounted existing encrypted disk {}", disk.name);
    Ok(())
}

fn close_after_failure(backend: &dyn DiskBackend, mapper: &str) {
    if let Err(e) = backend.luks_close(mapper) {
        log::warn!("failed to close {mapper} after error: {e:#}");
    }
}
