//! TPM-backed secret storage.
//!
//! The TPM holds a single secret at a fixed NV index. Only one key provider
//! may be TPM-backed at a time (see [`crate::keys::KeyManager::new`]); the
//! storage itself does no arbitration.

#[cfg(feature = "esapi")]
pub mod esapi;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::Secret;
use crate::command::Tool;
use crate::error::TrustedStorageError;

pub const DEFAULT_NV_INDEX: u32 = 0x0150_0016;
const TCTI_DEVICE: &str = "device:/dev/tpmrm0";
const TCTI_ENV: &str = "TPM2TOOLS_TCTI";
const TPM_DEVICE: &str = "/dev/tpm0";
const TPM_RM_DEVICE: &str = "/dev/tpmrm0";

/// Check that both the raw and the resource-managed TPM devices exist.
pub fn detect_platform() -> bool {
    Path::new(TPM_DEVICE).exists() && Path::new(TPM_RM_DEVICE).exists()
}

/// Storage for one secret blob in trusted hardware.
pub trait TrustedStorage: Send + Sync {
    fn available(&self) -> bool;

    /// Replace whatever is stored with `secret`.
    fn store(&self, secret: &[u8]) -> Result<()>;

    /// Read the stored secret. Fails with [`TrustedStorageError::NotFound`]
    /// when nothing (or an empty value) is stored.
    fn retrieve(&self) -> Result<Secret>;

    fn clear(&self) -> Result<()>;
}

/// Pick the TPM backend for this build.
pub fn detect_storage() -> Arc<dyn TrustedStorage> {
    #[cfg(feature = "esapi")]
    if detect_platform() {
        log::info!("using in-process TPM NV storage");
        return Arc::new(esapi::EsapiNvStorage::default());
    }

    Arc::new(NvStorage::default())
}

/// NV storage through `tpm2-tools`.
pub struct NvStorage {
    nv_index: String,
}

impl Default for NvStorage {
    fn default() -> Self {
        Self::new(DEFAULT_NV_INDEX)
    }
}

impl NvStorage {
    pub fn new(nv_index: u32) -> Self {
        Self {
            nv_index: format!("{nv_index:#x}"),
        }
    }

    fn tool(&self, name: &'static str) -> Tool {
        Tool::new(name).env(TCTI_ENV, TCTI_DEVICE)
    }

    fn undefine(&self) -> Result<()> {
        let output = self.tool("tpm2_nvundefine").arg(&self.nv_index).output()?;
        if !output.success() {
            return Err(TrustedStorageError::Tool {
                tool: "tpm2_nvundefine",
                detail: output.diagnostic(),
            }
            .into());
        }
        Ok(())
    }
}

impl TrustedStorage for NvStorage {
    fn available(&self) -> bool {
        detect_platform()
    }

    fn store(&self, secret: &[u8]) -> Result<()> {
        if !self.available() {
            return Err(TrustedStorageError::Unavailable.into());
        }

        // A previous definition may have a different size.
        self.undefine().ok();

        log::info!(
            "defining TPM NV index {} with size {}",
            self.nv_index,
            secret.len()
        );
        let output = self
            .tool("tpm2_nvdefine")
            .arg("-s")
            .arg(secret.len().to_string())
            .arg(&self.nv_index)
            .output()?;
        if !output.success() {
            return Err(TrustedStorageError::Tool {
                tool: "tpm2_nvdefine",
                detail: output.diagnostic(),
            }
            .into());
        }

        let output = self
            .tool("tpm2_nvwrite")
            .arg(&self.nv_index)
            .arg("-i-")
            .stdin(secret)
            .output()?;
        if !output.success() {
            self.undefine().ok();
            return Err(TrustedStorageError::Tool {
                tool: "tpm2_nvwrite",
                detail: output.diagnostic(),
            }
            .into());
        }

        log::info!("stored secret in TPM NV index {}", self.nv_index);
        Ok(())
    }

    fn retrieve(&self) -> Result<Secret> {
        if !self.available() {
            return Err(TrustedStorageError::Unavailable.into());
        }

        log::debug!("reading TPM NV index {}", self.nv_index);
        let output = self.tool("tpm2_nvread").arg(&self.nv_index).output()?;
        if !output.success() {
            if output.stderr.contains("ERROR") || output.stderr.contains("not found") {
                return Err(TrustedStorageError::NotFound(self.nv_index.clone()).into());
            }
            return Err(TrustedStorageError::Tool {
                tool: "tpm2_nvread",
                detail: output.diagnostic(),
            }
            .into());
        }

        let stdout = Zeroizing::new(output.stdout);
        let secret = stdout.trim_ascii();
        if secret.is_empty() {
            return Err(TrustedStorageError::NotFound(self.nv_index.clone()).into());
        }
        Ok(Zeroizing::new(secret.to_vec()))
    }

    fn clear(&self) -> Result<()> {
        if !self.available() {
            return Err(TrustedStorageError::Unavailable.into());
        }
        self.undefine()
    }
}
