//! Named encryption keys.
//!
//! Every key is produced by one strategy ([`GeneratedKey`] or [`PipedKey`])
//! and cached for the rest of the run. At most one key may be mirrored into
//! the TPM, which only has room for a single secret.

mod fifo;
mod generated;
mod piped;

pub use generated::GeneratedKey;
pub use piped::PipedKey;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::Secret;
use crate::config::{KeyConfig, KeyStrategy};
use crate::tpm::TrustedStorage;

#[async_trait]
pub trait KeyProvider: Send {
    /// Produce the secret, obtaining it on first use.
    async fn get(&mut self, cancel: &CancellationToken) -> Result<Secret>;

    /// Replace the secret, mirroring it to the TPM when backed.
    fn store(&mut self, secret: &[u8]) -> Result<()>;
}

/// Optional TPM mirror shared by both strategies.
pub(crate) struct TpmBacking {
    storage: Option<Arc<dyn TrustedStorage>>,
}

impl TpmBacking {
    pub(crate) fn new(enabled: bool, storage: Arc<dyn TrustedStorage>) -> Self {
        Self {
            storage: enabled.then_some(storage),
        }
    }

    fn available(&self) -> Option<&dyn TrustedStorage> {
        self.storage
            .as_deref()
            .filter(|storage| storage.available())
    }

    /// Secret already held by the TPM, if any.
    pub(crate) fn recall(&self) -> Option<Secret> {
        let storage = self.available()?;
        match storage.retrieve() {
            Ok(secret) => {
                log::info!("retrieved existing key from TPM");
                Some(secret)
            }
            Err(e) => {
                log::info!("no existing key in TPM: {e}");
                None
            }
        }
    }

    /// Best-effort copy into the TPM.
    pub(crate) fn mirror(&self, secret: &[u8]) {
        if let Some(storage) = self.available() {
            if let Err(e) = storage.store(secret) {
                log::warn!("failed to store key in TPM: {e:#}");
            }
        }
    }

    pub(crate) fn store(&self, secret: &[u8]) -> Result<()> {
        match self.available() {
            Some(storage) => storage.store(secret),
            None => Ok(()),
        }
    }
}

pub fn create_provider(
    config: &KeyConfig,
    storage: Arc<dyn TrustedStorage>,
) -> Result<Box<dyn KeyProvider>> {
    let backing = TpmBacking::new(config.tpm, storage);
    Ok(match config.strategy()? {
        KeyStrategy::Random { size } => Box::new(GeneratedKey::new(size, backing)),
        KeyStrategy::Pipe { path } => Box::new(PipedKey::new(path, backing)),
    })
}

pub struct KeyManager {
    keys: BTreeMap<String, Box<dyn KeyProvider>>,
}

impl KeyManager {
    /// Build a provider for every configured key.
    ///
    /// Fails if more than one key asks for TPM backing.
    pub fn new(
        keys: &BTreeMap<String, KeyConfig>,
        storage: Arc<dyn TrustedStorage>,
    ) -> Result<Self> {
        let tpm_backed: Vec<&str> = keys
            .iter()
            .filter(|(_, key)| key.tpm)
            .map(|(name, _)| name.as_str())
            .collect();
        if tpm_backed.len() > 1 {
            bail!(
                "only one key with TPM enabled is supported, found: {}",
                tpm_backed.join(", ")
            );
        }

        let mut providers = BTreeMap::new();
        for (name, key) in keys {
            let provider = create_provider(key, storage.clone())
                .with_context(|| format!("failed to create key provider for {name}"))?;
            providers.insert(name.clone(), provider);
        }

        Ok(Self { keys: providers })
    }

    pub async fn get_key(&mut self, name: &str, cancel: &CancellationToken) -> Result<Secret> {
        self.keys
            .get_mut(name)
            .ok_or_else(|| anyhow!("key {name} not found"))?
            .get(cancel)
            .await
            .with_context(|| format!("failed to get key {name}"))
    }

    pub fn store_key(&mut self, name: &str, secret: &[u8]) -> Result<()> {
        self.keys
            .get_mut(name)
            .ok_or_else(|| anyhow!("key {name} not found"))?
            .store(secret)
            .with_context(|| format!("failed to store key {name}"))
    }
}
