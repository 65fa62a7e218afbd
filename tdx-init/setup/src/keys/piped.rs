use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{KeyProvider, TpmBacking, fifo};
use crate::Secret;

/// A secret delivered by an operator through a named pipe.
pub struct PipedKey {
    path: PathBuf,
    backing: TpmBacking,
    cached: Option<Secret>,
}

impl PipedKey {
    pub(crate) fn new(path: PathBuf, backing: TpmBacking) -> Self {
        Self {
            path,
            backing,
            cached: None,
        }
    }
}

#[async_trait]
impl KeyProvider for PipedKey {
    async fn get(&mut self, cancel: &CancellationToken) -> Result<Secret> {
        if let Some(secret) = &self.cached {
            return Ok(secret.clone());
        }

        if let Some(secret) = self.backing.recall() {
            self.cached = Some(secret.clone());
            return Ok(secret);
        }

        let secret = fifo::read(&self.path, cancel).await?;
        self.cached = Some(secret.clone());
        self.backing.mirror(&secret);
        Ok(secret)
    }

    fn store(&mut self, secret: &[u8]) -> Result<()> {
        self.cached = Some(Zeroizing::new(secret.to_vec()));
        self.backing.store(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_cancelled;
    use crate::testing::MemoryStorage;
    use std::fs;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn tpm_hit_skips_the_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::with_secret(b"from-tpm"));
        let cancel = CancellationToken::new();
        let mut key = PipedKey::new(
            dir.path().join("passphrase"),
            TpmBacking::new(true, storage.clone()),
        );

        let secret = key.get(&cancel).await.unwrap();
        assert_eq!(secret.as_slice(), b"from-tpm");
        assert!(!dir.path().join("passphrase").exists());
    }

    #[tokio::test]
    async fn pipe_delivery_is_cached_and_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passphrase");
        let storage = Arc::new(MemoryStorage::default());
        let cancel = CancellationToken::new();
        let mut key = PipedKey::new(path.clone(), TpmBacking::new(true, storage.clone()));

        let writer = tokio::spawn(async move {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::task::spawn_blocking(move || {
                let mut pipe = fs::OpenOptions::new().write(true).open(&path).unwrap();
                pipe.write_all(b"operator-secret").unwrap();
            })
            .await
            .unwrap();
        });

        let secret = key.get(&cancel).await.unwrap();
        writer.await.unwrap();
        assert_eq!(secret.as_slice(), b"operator-secret");
        assert_eq!(storage.contents().as_deref(), Some(&b"operator-secret"[..]));

        // Second call is served from memory; nobody writes to the pipe again.
        let again = tokio::time::timeout(Duration::from_secs(1), key.get(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, secret);
    }

    #[tokio::test]
    async fn cancelled_before_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passphrase");
        let storage = Arc::new(MemoryStorage::default());
        let cancel = CancellationToken::new();
        let mut key = PipedKey::new(path.clone(), TpmBacking::new(false, storage));

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), key.get(&cancel))
            .await
            .unwrap()
            .unwrap_err();
        assert!(is_cancelled(&err));

        let _ = fs::OpenOptions::new().write(true).open(&path);
    }
}
