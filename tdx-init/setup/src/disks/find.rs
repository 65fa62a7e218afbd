//! Resolving a disk role to a block device.

use anyhow::{Context, Result, anyhow, bail};
use nix::sys::stat::{major, minor};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use super::filesystem::{MOUNTS_PATH, root_source};
use crate::config::{DiskConfig, DiskStrategy};

const PARTITIONS_PATH: &str = "/proc/partitions";
const DEV_ROOT: &str = "/dev";
const SYS_ROOT: &str = "/sys";

pub trait DiskFinder: Send + Sync {
    fn find(&self) -> Result<PathBuf>;
}

pub fn finder_for(config: &DiskConfig) -> Result<Box<dyn DiskFinder>> {
    Ok(match config.strategy()? {
        DiskStrategy::Largest => Box::new(LargestDiskFinder::default()),
        DiskStrategy::PathGlob { pattern } => Box::new(PathGlobFinder::new(pattern)),
    })
}

/// Picks the largest whole `sd*` disk listed in `/proc/partitions`.
///
/// Partitions are told apart from whole disks only by a trailing digit, so
/// `nvme0n1`-style names and `sdaa`+ style numbering are not handled.
pub struct LargestDiskFinder {
    partitions: PathBuf,
}

impl Default for LargestDiskFinder {
    fn default() -> Self {
        Self {
            partitions: PathBuf::from(PARTITIONS_PATH),
        }
    }
}

impl LargestDiskFinder {
    pub fn with_partitions(partitions: impl Into<PathBuf>) -> Self {
        Self {
            partitions: partitions.into(),
        }
    }
}

impl DiskFinder for LargestDiskFinder {
    fn find(&self) -> Result<PathBuf> {
        let listing = fs::read_to_string(&self.partitions)
            .with_context(|| format!("failed to read {}", self.partitions.display()))?;
        let (name, size) =
            largest_whole_disk(&listing).ok_or_else(|| anyhow!("no SCSI disk found"))?;
        log::info!("largest disk is {name} ({size} bytes)");
        Ok(Path::new(DEV_ROOT).join(name))
    }
}

/// Largest whole `sd*` disk in a partition listing, with its size in bytes.
pub(crate) fn largest_whole_disk(listing: &str) -> Option<(&str, u64)> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("major"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [_, _, blocks, name, ..] = fields[..] else {
                return None;
            };
            let whole_disk = name.starts_with("sd")
                && !name.chars().last().is_some_and(|c| c.is_ascii_digit());
            if !whole_disk {
                return None;
            }
            let blocks: u64 = blocks.parse().ok()?;
            Some((name, blocks.saturating_mul(1024)))
        })
        .fold(None::<(&str, u64)>, |best, candidate| match best {
            Some(current) if current.1 >= candidate.1 => Some(current),
            _ => Some(candidate),
        })
}

/// First block device matching a glob, never the disk holding `/`.
pub struct PathGlobFinder {
    pattern: String,
    dev_root: PathBuf,
    mounts: PathBuf,
    sys_root: PathBuf,
    root_dev: Option<u64>,
}

impl PathGlobFinder {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            dev_root: PathBuf::from(DEV_ROOT),
            mounts: PathBuf::from(MOUNTS_PATH),
            sys_root: PathBuf::from(SYS_ROOT),
            root_dev: fs::metadata("/").ok().map(|meta| meta.dev()),
        }
    }

    /// Override the device namespace and mount table (used by tests).
    pub fn with_roots(
        pattern: impl Into<String>,
        dev_root: impl Into<PathBuf>,
        mounts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            dev_root: dev_root.into(),
            mounts: mounts.into(),
            sys_root: PathBuf::from(SYS_ROOT),
            root_dev: None,
        }
    }

    /// Override the sysfs tree and the device number of `/`.
    pub fn with_root_device(mut self, sys_root: impl Into<PathBuf>, root_dev: u64) -> Self {
        self.sys_root = sys_root.into();
        self.root_dev = Some(root_dev);
        self
    }

    fn root_source(&self) -> Option<String> {
        let table = fs::read_to_string(&self.mounts).ok()?;
        root_source(&table)
    }

    /// Kernel names of the block device under `/` and, for a partition, its
    /// disk. Resolved through sysfs since the mount table may only say
    /// `/dev/root`.
    fn root_disks(&self) -> Vec<String> {
        let Some(dev) = self.root_dev else {
            return Vec::new();
        };
        let link = self
            .sys_root
            .join("dev/block")
            .join(format!("{}:{}", major(dev), minor(dev)));
        let Ok(target) = fs::read_link(&link) else {
            return Vec::new();
        };

        let mut names: Vec<String> = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .into_iter()
            .collect();
        if link.join("partition").exists() {
            if let Some(disk) = target.parent().and_then(Path::file_name) {
                names.push(disk.to_string_lossy().into_owned());
            }
        }
        names
    }
}

impl DiskFinder for PathGlobFinder {
    fn find(&self) -> Result<PathBuf> {
        let matches = glob::glob(&self.pattern)
            .with_context(|| format!("invalid glob pattern {}", self.pattern))?;
        let root_source = self.root_source();
        let root_disks = self.root_disks();

        for path in matches.filter_map(Result::ok) {
            if !path.starts_with(&self.dev_root) {
                continue;
            }

            let by_source = root_source
                .as_ref()
                .is_some_and(|root| root.starts_with(path.to_string_lossy().as_ref()));
            let kernel_name = fs::canonicalize(&path)
                .unwrap_or_else(|_| path.clone())
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let by_device = kernel_name.is_some_and(|name| root_disks.contains(&name));
            if by_source || by_device {
                log::info!("skipping {}: it holds the root filesystem", path.display());
                continue;
            }

            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if meta.file_type().is_char_device() {
                continue;
            }

            return Ok(path);
        }

        bail!("no disk found matching pattern {}", self.pattern)
    }
}
