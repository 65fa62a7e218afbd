//! LUKS2 containers and the filesystem tools around them.
//!
//! Two tokens in the LUKS2 header carry this tool's state: token 1 marks a
//! container as initialized, token 2 carries the operator's SSH key. Tokens
//! live outside the encrypted payload and can be read without the passphrase.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::filesystem::{MOUNTS_PATH, is_mounted};
use crate::command::Tool;

pub const INIT_TOKEN_ID: u32 = 1;
pub const SSH_TOKEN_ID: u32 = 2;

const INIT_TOKEN_TYPE: &str = "tdx-init";
const SSH_TOKEN_TYPE: &str = "ssh-key";

/// A LUKS2 header token. Unknown fields are ignored so tokens written by
/// other versions still parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub keyslots: Vec<String>,
    #[serde(default)]
    pub user_data: BTreeMap<String, Value>,
}

impl Token {
    fn new(kind: &str, user_data: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.to_string(),
            keyslots: Vec::new(),
            user_data: user_data
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        }
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.user_data.get(name).and_then(Value::as_str)
    }
}

/// The block-device operations a disk setup needs.
pub trait DiskBackend: Send + Sync {
    fn is_luks(&self, device: &Path) -> bool;
    fn luks_format(&self, device: &Path, passphrase: &[u8]) -> Result<()>;
    fn luks_open(&self, device: &Path, mapper: &str, passphrase: &[u8]) -> Result<()>;
    fn luks_close(&self, mapper: &str) -> Result<()>;
    /// Write raw token JSON into the header slot `id`.
    fn token_import(&self, device: &Path, id: u32, json: &str) -> Result<()>;
    /// Raw token JSON from header slot `id`.
    fn token_export(&self, device: &Path, id: u32) -> Result<String>;
    fn make_filesystem(&self, device: &Path) -> Result<()>;
    /// Mount `device` at `target`; a no-op if `target` is already mounted.
    fn mount(&self, device: &Path, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

pub fn is_initialized(backend: &dyn DiskBackend, device: &Path) -> bool {
    backend
        .token_export(device, INIT_TOKEN_ID)
        .ok()
        .and_then(|json| serde_json::from_str::<Token>(&json).ok())
        .is_some_and(|token| token.field("initialized") == Some("true"))
}

pub fn store_init_token(backend: &dyn DiskBackend, device: &Path, disk_name: &str) -> Result<()> {
    let token = Token::new(
        INIT_TOKEN_TYPE,
        &[("initialized", "true"), ("disk_name", disk_name)],
    );
    let json = serde_json::to_string(&token).context("failed to marshal init token")?;
    backend
        .token_import(device, INIT_TOKEN_ID, &json)
        .context("failed to store init token")
}

pub fn store_ssh_token(backend: &dyn DiskBackend, device: &Path, ssh_key: &str) -> Result<()> {
    let token = Token::new(SSH_TOKEN_TYPE, &[("ssh_key", ssh_key)]);
    let json = serde_json::to_string(&token).context("failed to marshal SSH token")?;
    backend
        .token_import(device, SSH_TOKEN_ID, &json)
        .context("failed to store SSH token")
}

pub fn get_ssh_token(backend: &dyn DiskBackend, device: &Path) -> Result<String> {
    let json = backend
        .token_export(device, SSH_TOKEN_ID)
        .context("no SSH token found")?;
    let token: Token = serde_json::from_str(&json).context("failed to parse SSH token")?;
    token
        .field("ssh_key")
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no SSH key in token"))
}

/// The real thing: `cryptsetup`, `mkfs.ext4`, `mount`, `umount`.
pub struct SystemBackend {
    mounts: PathBuf,
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self {
            mounts: PathBuf::from(MOUNTS_PATH),
        }
    }
}

impl DiskBackend for SystemBackend {
    fn is_luks(&self, device: &Path) -> bool {
        Tool::new("cryptsetup").arg("isLuks").arg(device).succeeds()
    }

    fn luks_format(&self, device: &Path, passphrase: &[u8]) -> Result<()> {
        log::info!("formatting {} with LUKS2 encryption", device.display());
        Tool::new("cryptsetup")
            .args(["luksFormat", "--type", "luks2", "-q"])
            .arg(device)
            .stdin(passphrase)
            .run()
            .context("failed to format with LUKS")?;
        Ok(())
    }

    fn luks_open(&self, device: &Path, mapper: &str, passphrase: &[u8]) -> Result<()> {
        Tool::new("cryptsetup")
            .arg("open")
            .arg(device)
            .arg(mapper)
            .stdin(passphrase)
            .run()
            .context("failed to open LUKS device")?;
        Ok(())
    }

    fn luks_close(&self, mapper: &str) -> Result<()> {
        Tool::new("cryptsetup")
            .arg("close")
            .arg(mapper)
            .run()
            .context("failed to close LUKS device")?;
        Ok(())
    }

    fn token_import(&self, device: &Path, id: u32, json: &str) -> Result<()> {
        Tool::new("cryptsetup")
            .args(["token", "import", "--token-id"])
            .arg(id.to_string())
            .arg(device)
            .stdin(json.as_bytes())
            .run()?;
        Ok(())
    }

    fn token_export(&self, device: &Path, id: u32) -> Result<String> {
        let output = Tool::new("cryptsetup")
            .args(["token", "export", "--token-id"])
            .arg(id.to_string())
            .arg(device)
            .run()?;
        String::from_utf8(output.stdout).context("token is not valid UTF-8")
    }

    fn make_filesystem(&self, device: &Path) -> Result<()> {
        log::info!("creating ext4 filesystem on {}", device.display());
        Tool::new("mkfs.ext4")
            .arg(device)
            .run()
            .context("failed to create filesystem")?;
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<()> {
        if is_mounted(&self.mounts, target) {
            log::info!("device already mounted at {}", target.display());
            return Ok(());
        }
        fs::create_dir_all(target).context("failed to create mount point")?;
        Tool::new("mount")
            .arg(device)
            .arg(target)
            .run()
            .context("failed to mount device")?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if !is_mounted(&self.mounts, target) {
            return Ok(());
        }
        Tool::new("umount")
            .arg(target)
            .run()
            .context("failed to unmount device")?;
        Ok(())
    }
}
