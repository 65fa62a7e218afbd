use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{KeyProvider, TpmBacking};
use crate::Secret;
use crate::crypto::{self, HW_RNG};

/// A random secret generated on first boot and recalled from the TPM after.
pub struct GeneratedKey {
    size: usize,
    hw_rng: PathBuf,
    backing: TpmBacking,
    cached: Option<Secret>,
}

impl GeneratedKey {
    pub(crate) fn new(size: usize, backing: TpmBacking) -> Self {
        Self {
            size,
            hw_rng: PathBuf::from(HW_RNG),
            backing,
            cached: None,
        }
    }
}

#[async_trait]
impl KeyProvider for GeneratedKey {
    async fn get(&mut self, _cancel: &CancellationToken) -> Result<Secret> {
        if let Some(secret) = &self.cached {
            return Ok(secret.clone());
        }

        if let Some(secret) = self.backing.recall() {
            self.cached = Some(secret.clone());
            return Ok(secret);
        }

        let secret = crypto::generate_secret_from(&self.hw_rng, self.size)?;
        self.cached = Some(secret.clone());
        self.backing.mirror(&secret);
        Ok(secret)
    }

    fn store(&mut self, secret: &[u8]) -> Result<()> {
        self.cached = Some(Zeroizing::new(secret.to_vec()));
        self.backing.store(secret)
    }
}
