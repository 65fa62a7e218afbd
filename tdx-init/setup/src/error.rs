use thiserror::Error;

/// The surrounding operation was cancelled before it produced a result.
///
/// Returned by the waits that block on an operator (named pipe, SSH key
/// handshake) so callers can tell "nobody supplied it" apart from "the
/// supplier failed". Recover it with `err.downcast_ref::<Cancelled>()`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Outcomes of the trusted-storage adapter that callers branch on.
#[derive(Error, Debug)]
pub enum TrustedStorageError {
    #[error("TPM device not available")]
    Unavailable,
    #[error("no secret stored in TPM at NV index {0}")]
    NotFound(String),
    #[error("{tool} failed: {detail}")]
    Tool { tool: &'static str, detail: String },
}

/// True if `err` (or anything it wraps) is a [`Cancelled`] outcome.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}
