//! Typed configuration tree.
//!
//! Each component takes its `strategy` name plus a free-form
//! `strategy_config` table; the `strategy()` accessors turn those into a
//! closed set of typed variants so unknown names fail before anything on
//! the system is touched.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_SSH_DIR: &str = "/root/.ssh";
const DEFAULT_KEY_PATH: &str = "/etc/root_key";
const DEFAULT_SERVER_URL: &str = "0.0.0.0:8080";
const DEFAULT_KEY_SIZE: usize = 64;
/// Raw bytes; the base64 form has to fit a TPM NV index.
const MAX_KEY_SIZE: usize = 1024;
const DEFAULT_PIPE_PATH: &str = "/tmp/passphrase";
const DEFAULT_PATH_GLOB: &str = "/dev/sd*";

/// Annotated starting point written by `tdx-init generate-config`.
pub const EXAMPLE: &str = r#"# tdx-init configuration

[ssh]
# How the operator hands over the SSH key. Only "webserver" exists.
strategy = "webserver"
# Directory that receives authorized_keys.
dir = "/root/.ssh"
# Extra copy of the raw key; set to "" to disable.
key_path = "/etc/root_key"
# Keep the key in a LUKS token on this disk so reboots skip the handshake.
store_at = "disk_persistent"

[ssh.strategy_config]
server_url = "0.0.0.0:8080"

[keys.key_persistent]
# "random" or "pipe" (strategy_config.pipe_path, default /tmp/passphrase).
strategy = "random"
# Keep the key in TPM NV storage. At most one key may set this.
tpm = true

[keys.key_persistent.strategy_config]
# Random bytes before base64 encoding, 1 to 1024.
size = 64

[disks.disk_persistent]
# "largest" or "pathglob" (strategy_config.path_glob, default /dev/sd*).
strategy = "largest"
# "always" wipes on every boot, "on_initialize" only when not yet set up,
# "never" only mounts.
format = "on_initialize"
# Omit for an unencrypted disk.
encryption_key = "key_persistent"
mount_at = "/persistent"

# [disks.disk_data]
# strategy = "pathglob"
# format = "on_initialize"
# mount_at = "/data"
#
# [disks.disk_data.strategy_config]
# path_glob = "/dev/nvme*"
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ssh: SshConfig,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyConfig>,
    #[serde(default)]
    pub disks: BTreeMap<String, DiskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub strategy: String,
    #[serde(default)]
    pub strategy_config: toml::Table,
    #[serde(default = "default_ssh_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: Option<PathBuf>,
    /// Disk whose LUKS header carries the SSH key token across reboots.
    #[serde(default)]
    pub store_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub strategy: String,
    #[serde(default)]
    pub strategy_config: toml::Table,
    /// Mirror the secret into TPM NV storage.
    #[serde(default)]
    pub tpm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub strategy: String,
    #[serde(default)]
    pub strategy_config: toml::Table,
    #[serde(default)]
    pub format: FormatPolicy,
    #[serde(default)]
    pub encryption_key: Option<String>,
    pub mount_at: PathBuf,
}

/// When a disk may be wiped and reformatted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatPolicy {
    Always,
    #[default]
    OnInitialize,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshStrategy {
    WebServer { listen: SocketAddr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    Random { size: usize },
    Pipe { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskStrategy {
    Largest,
    PathGlob { pattern: String },
}

fn default_ssh_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SSH_DIR)
}

fn default_key_path() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_KEY_PATH))
}

fn string_option<'a>(table: &'a toml::Table, field: &str) -> Result<Option<&'a str>> {
    match table.get(field) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => bail!("{field} must be a string, got {}", other.type_str()),
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(raw).context("failed to parse configuration")?;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    /// Check strategies and cross references, normalising optional paths.
    pub fn validate(&mut self) -> Result<()> {
        self.ssh.strategy().context("ssh")?;
        if self.ssh.dir.as_os_str().is_empty() {
            self.ssh.dir = default_ssh_dir();
        }
        if self
            .ssh
            .key_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            self.ssh.key_path = None;
        }

        for (name, key) in &self.keys {
            key.strategy().with_context(|| format!("keys.{name}"))?;
        }

        for (name, disk) in &self.disks {
            disk.strategy().with_context(|| format!("disks.{name}"))?;
            if disk.mount_at.as_os_str().is_empty() {
                bail!("disks.{name}.mount_at is required");
            }
            if let Some(key) = &disk.encryption_key {
                if !self.keys.contains_key(key) {
                    bail!("disks.{name}.encryption_key references non-existent key '{key}'");
                }
            }
        }

        if let Some(disk) = &self.ssh.store_at {
            if !self.disks.contains_key(disk) {
                bail!("ssh.store_at references non-existent disk '{disk}'");
            }
        }

        Ok(())
    }
}

impl SshConfig {
    pub fn strategy(&self) -> Result<SshStrategy> {
        match self.strategy.as_str() {
            "webserver" => {
                let url = string_option(&self.strategy_config, "server_url")?
                    .unwrap_or(DEFAULT_SERVER_URL);
                // `:8080` means every interface.
                let url = match url.strip_prefix(':') {
                    Some(port) => format!("0.0.0.0:{port}"),
                    None => url.to_string(),
                };
                let listen = url
                    .parse()
                    .with_context(|| format!("invalid server_url '{url}'"))?;
                Ok(SshStrategy::WebServer { listen })
            }
            "" => bail!("strategy is required"),
            other => bail!("unknown SSH strategy: {other}"),
        }
    }
}

impl KeyConfig {
    pub fn strategy(&self) -> Result<KeyStrategy> {
        match self.strategy.as_str() {
            "random" => {
                let size = match self.strategy_config.get("size") {
                    None => DEFAULT_KEY_SIZE,
                    Some(toml::Value::Integer(n)) if *n > 0 && *n as usize <= MAX_KEY_SIZE => {
                        *n as usize
                    }
                    Some(other) => {
                        bail!("size must be an integer from 1 to {MAX_KEY_SIZE}, got {other}")
                    }
                };
                Ok(KeyStrategy::Random { size })
            }
            "pipe" => {
                let path = string_option(&self.strategy_config, "pipe_path")?
                    .unwrap_or(DEFAULT_PIPE_PATH);
                Ok(KeyStrategy::Pipe {
                    path: PathBuf::from(path),
                })
            }
            "" => bail!("strategy is required"),
            other => bail!("unknown key strategy: {other}"),
        }
    }
}

impl DiskConfig {
    pub fn strategy(&self) -> Result<DiskStrategy> {
        match self.strategy.as_str() {
            "largest" => Ok(DiskStrategy::Largest),
            "pathglob" => {
                let pattern = string_option(&self.strategy_config, "path_glob")?
                    .unwrap_or(DEFAULT_PATH_GLOB);
                Ok(DiskStrategy::PathGlob {
                    pattern: pattern.to_string(),
                })
            }
            "" => bail!("strategy is required"),
            other => bail!("unknown disk strategy: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[ssh]
strategy = "webserver"
store_at = "disk_persistent"

[ssh.strategy_config]
server_url = ":8080"

[keys.key_persistent]
strategy = "random"
tpm = true

[disks.disk_persistent]
strategy = "largest"
encryption_key = "key_persistent"
mount_at = "/persistent"

[disks.scratch]
strategy = "pathglob"
format = "never"
mount_at = "/scratch"

[disks.scratch.strategy_config]
path_glob = "/dev/nvme*"
"#;

    #[test]
    fn parses_example_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.ssh.dir, PathBuf::from("/root/.ssh"));
        assert_eq!(config.ssh.key_path, Some(PathBuf::from("/etc/root_key")));
        assert_eq!(
            config.ssh.strategy().unwrap(),
            SshStrategy::WebServer {
                listen: "0.0.0.0:8080".parse().unwrap()
            }
        );

        let key = &config.keys["key_persistent"];
        assert!(key.tpm);
        assert_eq!(key.strategy().unwrap(), KeyStrategy::Random { size: 64 });

        let persistent = &config.disks["disk_persistent"];
        assert_eq!(persistent.format, FormatPolicy::OnInitialize);
        assert_eq!(persistent.strategy().unwrap(), DiskStrategy::Largest);

        let scratch = &config.disks["scratch"];
        assert_eq!(scratch.format, FormatPolicy::Never);
        assert_eq!(
            scratch.strategy().unwrap(),
            DiskStrategy::PathGlob {
                pattern: "/dev/nvme*".into()
            }
        );
    }

    #[test]
    fn shipped_example_is_valid() {
        let config = Config::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.ssh.store_at.as_deref(), Some("disk_persistent"));
        assert_eq!(
            config.keys["key_persistent"].strategy().unwrap(),
            KeyStrategy::Random { size: 64 }
        );
        assert_eq!(
            config.disks["disk_persistent"].encryption_key.as_deref(),
            Some("key_persistent")
        );
    }

    #[test]
    fn serializes_back_to_equivalent_toml() {
        let config = Config::from_toml(EXAMPLE).unwrap();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.ssh.dir, config.ssh.dir);
        assert_eq!(reparsed.disks["disk_persistent"].mount_at, PathBuf::from("/persistent"));
    }

    #[test]
    fn rejects_dangling_store_at() {
        let raw = r#"
[ssh]
strategy = "webserver"
store_at = "missing"
"#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(format!("{err:#}").contains("non-existent disk 'missing'"));
    }

    #[test]
    fn rejects_dangling_encryption_key() {
        let raw = r#"
[ssh]
strategy = "webserver"

[disks.data]
strategy = "largest"
encryption_key = "nope"
mount_at = "/data"
"#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(format!("{err:#}").contains("non-existent key 'nope'"));
    }

    #[test]
    fn rejects_unknown_strategies() {
        let raw = r#"
[ssh]
strategy = "webserver"

[keys.k]
strategy = "vault"
"#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(format!("{err:#}").contains("unknown key strategy: vault"));

        let raw = r#"
[ssh]
strategy = "carrier-pigeon"
"#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(format!("{err:#}").contains("unknown SSH strategy"));
    }

    #[test]
    fn rejects_unknown_format_policy() {
        let raw = r#"
[ssh]
strategy = "webserver"

[disks.data]
strategy = "largest"
format = "sometimes"
mount_at = "/data"
"#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn empty_key_path_disables_key_file() {
        let raw = r#"
[ssh]
strategy = "webserver"
key_path = ""
"#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.ssh.key_path, None);
    }

    #[test]
    fn pipe_strategy_defaults_and_size_validation() {
        let key = KeyConfig {
            strategy: "pipe".into(),
            strategy_config: toml::Table::new(),
            tpm: false,
        };
        assert_eq!(
            key.strategy().unwrap(),
            KeyStrategy::Pipe {
                path: PathBuf::from("/tmp/passphrase")
            }
        );

        let mut table = toml::Table::new();
        table.insert("size".into(), toml::Value::Integer(0));
        let key = KeyConfig {
            strategy: "random".into(),
            strategy_config: table,
            tpm: false,
        };
        assert!(key.strategy().is_err());
    }

    #[test]
    fn random_key_size_is_capped() {
        let random = |size: i64| {
            let mut table = toml::Table::new();
            table.insert("size".into(), toml::Value::Integer(size));
            KeyConfig {
                strategy: "random".into(),
                strategy_config: table,
                tpm: false,
            }
            .strategy()
        };
        assert_eq!(random(1024).unwrap(), KeyStrategy::Random { size: 1024 });
        assert!(random(1025).is_err());
        assert!(random(1_000_000_000_000).is_err());
    }
}
