use anyhow::{Context, Result};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

pub(crate) const MOUNTS_PATH: &str = "/proc/mounts";

/// `(source, mount point)` pairs from a `/proc/mounts` style table.
fn entries(table: &str) -> impl Iterator<Item = (String, PathBuf)> + '_ {
    table.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let target = fields.next()?;
        Some((unescape(source), PathBuf::from(unescape(target))))
    })
}

/// Undo the kernel's octal escaping (`\040` for a space).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = octal.and_then(|o| u8::from_str_radix(o, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn is_mounted_in(table: &str, target: &Path) -> bool {
    entries(table).any(|(_, mount_point)| mount_point == target)
}

/// Device backing `/`, if the table has one.
pub(crate) fn root_source(table: &str) -> Option<String> {
    entries(table)
        .filter(|(_, mount_point)| mount_point == Path::new("/"))
        .map(|(source, _)| source)
        .last()
}

pub(crate) fn is_mounted(mounts: &Path, target: &Path) -> bool {
    fs::read_to_string(mounts).is_ok_and(|table| is_mounted_in(&table, target))
}

/// Create owner-only subdirectories under a fresh mount point.
pub(crate) fn create_mount_dirs(mount_point: &Path, dirs: &[&str]) -> Result<()> {
    for dir in dirs {
        let path = mount_point.join(dir);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)
            .with_context(|| format!("failed to create directory {}", path.display()))?;
    }
    Ok(())
}
