//! Sequences disk setup and SSH provisioning for one boot.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::disks::{DiskBackend, DiskFinder, DiskManager, SystemBackend};
use crate::keys::KeyManager;
use crate::ssh::{KeyHandshake, SshManager};
use crate::tpm::{TrustedStorage, detect_storage};

pub struct Orchestrator {
    config: Config,
    keys: KeyManager,
    disks: DiskManager,
    ssh: SshManager,
}

impl Orchestrator {
    /// Wire every component against the real system.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backends(config, detect_storage(), Arc::new(SystemBackend::default()))
    }

    pub fn with_backends(
        config: Config,
        storage: Arc<dyn TrustedStorage>,
        backend: Arc<dyn DiskBackend>,
    ) -> Result<Self> {
        let keys = KeyManager::new(&config.keys, storage).context("failed to create key manager")?;
        let disks =
            DiskManager::new(&config.disks, backend).context("failed to create disk manager")?;
        let ssh = SshManager::new(&config.ssh).context("failed to create SSH manager")?;
        Ok(Self {
            config,
            keys,
            disks,
            ssh,
        })
    }

    pub fn with_finder(mut self, disk: &str, finder: Box<dyn DiskFinder>) -> Self {
        self.disks = self.disks.with_finder(disk, finder);
        self
    }

    pub fn with_handshake(mut self, handshake: Box<dyn KeyHandshake>) -> Self {
        self.ssh = SshManager::with_handshake(&self.config.ssh, handshake);
        self
    }

    pub fn disks(&self) -> &DiskManager {
        &self.disks
    }

    /// The SSH token disk first, then the rest.
    pub fn disk_order(&self) -> Vec<String> {
        let store_at = self.config.ssh.store_at.as_deref();
        store_at
            .into_iter()
            .filter(|name| self.config.disks.contains_key(*name))
            .chain(self.disks.names().filter(|name| Some(*name) != store_at))
            .map(str::to_string)
            .collect()
    }

    /// Set up every disk, then SSH. The first failure ends the run.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        for name in self.disk_order() {
            self.disks
                .setup_disk(&name, &mut self.keys, cancel)
                .await
                .with_context(|| format!("failed to setup disk {name}"))?;
        }

        self.ssh
            .setup(&self.disks, cancel)
            .await
            .context("failed to setup SSH")?;

        log::info!("initialization completed successfully");
        Ok(())
    }
}
