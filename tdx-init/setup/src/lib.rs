pub mod config;
pub mod crypto;
pub mod disks;
pub mod error;
pub mod keys;
pub mod setup;
pub mod ssh;
pub mod tpm;

mod command;
#[cfg(test)]
mod testing;

use zeroize::Zeroizing;

pub use config::Config;
pub use error::{Cancelled, TrustedStorageError, is_cancelled};
pub use setup::Orchestrator;

/// A secret held in memory for the life of the process.
pub type Secret = Zeroizing<Vec<u8>>;
