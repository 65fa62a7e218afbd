//! In-memory stand-ins for the TPM, cryptsetup and disk discovery.

use anyhow::{Result, anyhow, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use zeroize::Zeroizing;

use crate::Secret;
use crate::disks::{DiskBackend, DiskFinder};
use crate::error::TrustedStorageError;
use crate::tpm::TrustedStorage;

pub(crate) struct MemoryStorage {
    available: bool,
    fail_store: bool,
    secret: Mutex<Option<Vec<u8>>>,
    stores: AtomicUsize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            available: true,
            fail_store: false,
            secret: Mutex::new(None),
            stores: AtomicUsize::new(0),
        }
    }
}

impl MemoryStorage {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    pub fn failing_store() -> Self {
        Self {
            fail_store: true,
            ..Self::default()
        }
    }

    pub fn with_secret(secret: &[u8]) -> Self {
        Self {
            secret: Mutex::new(Some(secret.to_vec())),
            ..Self::default()
        }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.secret.lock().unwrap().clone()
    }

    pub fn store_calls(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

impl TrustedStorage for MemoryStorage {
    fn available(&self) -> bool {
        self.available
    }

    fn store(&self, secret: &[u8]) -> Result<()> {
        if !self.available {
            return Err(TrustedStorageError::Unavailable.into());
        }
        if self.fail_store {
            return Err(TrustedStorageError::Tool {
                tool: "tpm2_nvwrite",
                detail: "injected failure".into(),
            }
            .into());
        }
        self.stores.fetch_add(1, Ordering::SeqCst);
        *self.secret.lock().unwrap() = Some(secret.to_vec());
        Ok(())
    }

    fn retrieve(&self) -> Result<Secret> {
        if !self.available {
            return Err(TrustedStorageError::Unavailable.into());
        }
        match self.secret.lock().unwrap().as_ref() {
            Some(secret) if !secret.is_empty() => Ok(Zeroizing::new(secret.clone())),
            _ => Err(TrustedStorageError::NotFound("0x1500016".into()).into()),
        }
    }

    fn clear(&self) -> Result<()> {
        *self.secret.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
struct BackendState {
    /// Device -> passphrase of the LUKS container on it.
    containers: BTreeMap<PathBuf, Vec<u8>>,
    tokens: BTreeMap<(PathBuf, u32), String>,
    open: BTreeSet<String>,
    /// Mount point -> device.
    mounts: BTreeMap<PathBuf, PathBuf>,
    /// Devices in the order they were inspected.
    inspected: Vec<PathBuf>,
    formats: usize,
    opens: usize,
    mkfs: usize,
    fail_mounts: bool,
    fail_mkfs: bool,
    fail_token_import: bool,
}

/// A fake cryptsetup/mount layer that remembers what was done to it.
#[derive(Default)]
pub(crate) struct RecordingBackend {
    state: Mutex<BackendState>,
}

impl RecordingBackend {
    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    pub fn add_container(&self, device: &str, passphrase: &[u8]) {
        self.state()
            .containers
            .insert(PathBuf::from(device), passphrase.to_vec());
    }

    /// Forget open mappers and mounts, as after a reboot.
    pub fn reset_session(&self) {
        let mut state = self.state();
        state.open.clear();
        state.mounts.clear();
    }

    pub fn fail_mounts(&self, fail: bool) {
        self.state().fail_mounts = fail;
    }

    pub fn fail_mkfs(&self, fail: bool) {
        self.state().fail_mkfs = fail;
    }

    pub fn fail_token_import(&self, fail: bool) {
        self.state().fail_token_import = fail;
    }

    pub fn inspected(&self) -> Vec<PathBuf> {
        self.state().inspected.clone()
    }

    pub fn format_calls(&self) -> usize {
        self.state().formats
    }

    pub fn open_calls(&self) -> usize {
        self.state().opens
    }

    pub fn mkfs_calls(&self) -> usize {
        self.state().mkfs
    }

    pub fn is_open(&self, mapper: &str) -> bool {
        self.state().open.contains(mapper)
    }

    pub fn mounted_at(&self, target: &Path) -> Option<PathBuf> {
        self.state().mounts.get(target).cloned()
    }
}

impl DiskBackend for RecordingBackend {
    fn is_luks(&self, device: &Path) -> bool {
        let mut state = self.state();
        state.inspected.push(device.to_path_buf());
        state.containers.contains_key(device)
    }

    fn luks_format(&self, device: &Path, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.formats += 1;
        state
            .containers
            .insert(device.to_path_buf(), passphrase.to_vec());
        state.tokens.retain(|(dev, _), _| dev != device);
        Ok(())
    }

    fn luks_open(&self, device: &Path, mapper: &str, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.opens += 1;
        match state.containers.get(device) {
            Some(expected) if expected.as_slice() == passphrase => {}
            Some(_) => bail!("No key available with this passphrase."),
            None => bail!("Device {} is not a valid LUKS device.", device.display()),
        }
        state.open.insert(mapper.to_string());
        Ok(())
    }

    fn luks_close(&self, mapper: &str) -> Result<()> {
        if !self.state().open.remove(mapper) {
            bail!("Device {mapper} is not active.");
        }
        Ok(())
    }

    fn token_import(&self, device: &Path, id: u32, json: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_token_import {
            bail!("Failed to import token from file.");
        }
        state
            .tokens
            .insert((device.to_path_buf(), id), json.to_string());
        Ok(())
    }

    fn token_export(&self, device: &Path, id: u32) -> Result<String> {
        self.state()
            .tokens
            .get(&(device.to_path_buf(), id))
            .cloned()
            .ok_or_else(|| anyhow!("Token {id} is not in use."))
    }

    fn make_filesystem(&self, _device: &Path) -> Result<()> {
        let mut state = self.state();
        state.mkfs += 1;
        if state.fail_mkfs {
            bail!("mkfs.ext4 failed");
        }
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<()> {
        let mut state = self.state();
        if state.mounts.contains_key(target) {
            return Ok(());
        }
        if state.fail_mounts {
            bail!("mount: wrong fs type");
        }
        std::fs::create_dir_all(target)?;
        state
            .mounts
            .insert(target.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.state().mounts.remove(target);
        Ok(())
    }
}

/// Discovery that always resolves to the same path (or never resolves).
pub(crate) struct FixedFinder(Option<PathBuf>);

impl FixedFinder {
    pub fn new(path: &str) -> Self {
        Self(Some(PathBuf::from(path)))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl DiskFinder for FixedFinder {
    fn find(&self) -> Result<PathBuf> {
        self.0.clone().ok_or_else(|| anyhow!("no disk found"))
    }
}
