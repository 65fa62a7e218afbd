use anyhow::{Context, Result};
use std::str::FromStr;
use tss_esapi::Context as TpmContext;
use tss_esapi::abstraction::nv;
use tss_esapi::attributes::NvIndexAttributesBuilder;
use tss_esapi::handles::{NvIndexHandle, NvIndexTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::resource_handles::{NvAuth, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{MaxNvBuffer, NvPublicBuilder};
use tss_esapi::tcti_ldr::TctiNameConf;
use zeroize::Zeroizing;

use super::{DEFAULT_NV_INDEX, TCTI_DEVICE, TrustedStorage, detect_platform};
use crate::Secret;
use crate::error::TrustedStorageError;

/// NV storage through the TSS ESAPI, without shelling out to `tpm2-tools`.
pub struct EsapiNvStorage {
    nv_index: u32,
}

impl Default for EsapiNvStorage {
    fn default() -> Self {
        Self {
            nv_index: DEFAULT_NV_INDEX,
        }
    }
}

impl EsapiNvStorage {
    fn context(&self) -> Result<TpmContext> {
        let tcti = TctiNameConf::from_str(TCTI_DEVICE).context("failed to create TCTI config")?;
        TpmContext::new(tcti).context("failed to create TPM context")
    }

    fn nv_index(&self) -> Result<NvIndexTpmHandle> {
        NvIndexTpmHandle::new(self.nv_index).context("invalid NV index")
    }

    fn undefine(&self, ctx: &mut TpmContext) -> Result<()> {
        let index = self.nv_index()?;
        let object = ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(index)))
            .context("NV index is not defined")?;
        ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.nv_undefine_space(Provision::Owner, NvIndexHandle::from(object))
        })
        .map_err(|e| TrustedStorageError::Tool {
            tool: "nv_undefine_space",
            detail: e.to_string(),
        })?;
        Ok(())
    }
}

impl TrustedStorage for EsapiNvStorage {
    fn available(&self) -> bool {
        detect_platform()
    }

    fn store(&self, secret: &[u8]) -> Result<()> {
        if !self.available() {
            return Err(TrustedStorageError::Unavailable.into());
        }
        let mut ctx = self.context()?;
        self.undefine(&mut ctx).ok();

        let attributes = NvIndexAttributesBuilder::new()
            .with_owner_write(true)
            .with_owner_read(true)
            .build()
            .context("failed to build NV attributes")?;
        let public = NvPublicBuilder::new()
            .with_nv_index(self.nv_index()?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(secret.len())
            .build()
            .context("failed to build NV public area")?;
        let data = MaxNvBuffer::try_from(secret.to_vec()).context("secret too large for NV")?;

        let handle = ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_define_space(Provision::Owner, None, public)
            })
            .map_err(|e| TrustedStorageError::Tool {
                tool: "nv_define_space",
                detail: e.to_string(),
            })?;

        let written = ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.nv_write(NvAuth::Owner, handle, data, 0)
        });
        if let Err(e) = written {
            self.undefine(&mut ctx).ok();
            return Err(TrustedStorageError::Tool {
                tool: "nv_write",
                detail: e.to_string(),
            }
            .into());
        }

        log::info!("stored secret in TPM NV index {:#x}", self.nv_index);
        Ok(())
    }

    fn retrieve(&self) -> Result<Secret> {
        if !self.available() {
            return Err(TrustedStorageError::Unavailable.into());
        }
        let mut ctx = self.context()?;
        let index = self.nv_index()?;
        let raw = ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                nv::read_full(ctx, NvAuth::Owner, index)
            })
            .map_err(|_| TrustedStorageError::NotFound(format!("{:#x}", self.nv_index)))?;

        let raw = Zeroizing::new(raw);
        let secret = raw.trim_ascii();
        if secret.is_empty() {
            return Err(TrustedStorageError::NotFound(format!("{:#x}", self.nv_index)).into());
        }
        Ok(Zeroizing::new(secret.to_vec()))
    }

    fn clear(&self) -> Result<()> {
        if !self.available() {
            return Err(TrustedStorageError::Unavailable.into());
        }
        let mut ctx = self.context()?;
        self.undefine(&mut ctx)
    }
}
