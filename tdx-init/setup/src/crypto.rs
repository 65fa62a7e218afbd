use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as B64, STANDARD_NO_PAD as B64_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zeroize::Zeroizing;

use crate::Secret;

pub(crate) const HW_RNG: &str = "/dev/hwrng";

/// Generate `size` random bytes and return them base64-encoded.
///
/// Prefers the hardware RNG when the platform exposes one and falls back to
/// the OS CSPRNG if it is missing or returns a short read.
pub fn generate_secret(size: usize) -> Result<Secret> {
    generate_secret_from(Path::new(HW_RNG), size)
}

pub(crate) fn generate_secret_from(hw_rng: &Path, size: usize) -> Result<Secret> {
    let mut raw = Zeroizing::new(vec![0u8; size]);

    let from_hw = hw_rng.exists() && read_exact_from(hw_rng, &mut raw).is_ok();
    if from_hw {
        log::info!("using hardware RNG for key generation");
    } else {
        log::info!("using OS RNG for key generation");
        OsRng
            .try_fill_bytes(&mut raw)
            .context("failed to generate random key")?;
    }

    Ok(Zeroizing::new(B64.encode(raw.as_slice()).into_bytes()))
}

fn read_exact_from(path: &Path, buf: &mut [u8]) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    file.read_exact(buf).map_err(|e| {
        log::warn!("failed to read from {}: {e}", path.display());
        e
    })?;
    Ok(())
}

/// OpenSSH-style `SHA256:` fingerprint of a base64 public key blob.
pub fn ssh_fingerprint(key: &str) -> Result<String> {
    let blob = B64.decode(key).context("SSH key is not valid base64")?;
    let digest = Sha256::digest(&blob);
    Ok(format!("SHA256:{}", B64_NO_PAD.encode(digest)))
}
