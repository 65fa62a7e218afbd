use anyhow::{Context, Result, anyhow};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::Secret;
use crate::error::Cancelled;

/// Make sure a FIFO exists at `path`, replacing anything else found there.
pub(crate) fn ensure_fifo(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_fifo() {
            return Ok(());
        }
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale file at {}", path.display()))?;
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .with_context(|| format!("failed to create FIFO at {}", path.display()))
}

/// Wait for a writer to deliver a secret through the FIFO at `path`.
///
/// The read runs on a detached thread because a blocking `open`/`read` on a
/// FIFO cannot be interrupted. On cancellation the thread is abandoned: it
/// stays blocked until a writer shows up, and whatever it reads then is
/// dropped.
pub(crate) async fn read(path: &Path, cancel: &CancellationToken) -> Result<Secret> {
    ensure_fifo(path)?;
    log::info!("waiting for key on named pipe {}", path.display());

    let (tx, rx) = oneshot::channel();
    let worker_path: PathBuf = path.to_path_buf();
    thread::Builder::new()
        .name("fifo-reader".into())
        .spawn(move || {
            let data = fs::read(&worker_path).map(Zeroizing::new);
            // The receiver is gone if the wait was cancelled.
            let _ = tx.send(data);
        })
        .context("failed to spawn FIFO reader")?;

    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled.into()),
        received = rx => match received {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(e).with_context(|| format!("failed to read from pipe {}", path.display())),
            Err(_) => Err(anyhow!("FIFO reader exited without a result")),
        },
    }
}
