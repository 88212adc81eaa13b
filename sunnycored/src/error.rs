//! Admin-CLI error taxonomy and exit codes (§6).
//!
//! `sunnycore-core`'s `CoreError` already distinguishes transient/fatal/
//! auth/invariant/model failures; this module folds that taxonomy down
//! to the four-way exit code contract the admin surface promises an
//! operator or calling script.

use sunnycore_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("state corruption detected: {0}")]
    StateCorruption(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    /// Exit code contract from §6: 0 success, 2 not found, 3 provider
    /// rejection, 4 state-corruption detected. `Internal` (config/IO/
    /// startup failures outside that taxonomy) uses 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound(_) => 2,
            Self::ProviderRejected(_) => 3,
            Self::StateCorruption(_) => 4,
            Self::Internal(_) => 1,
        }
    }
}

/// Maps a component-level error onto the admin surface's taxonomy.
/// `Invariant` is always state corruption; anything else arising at a
/// provider/store call boundary is treated as a rejection. Callers that
/// can distinguish "not found" themselves (e.g. an unknown user id)
/// construct `CliError::NotFound` directly instead of going through
/// this conversion.
pub fn from_provider_error(err: CoreError) -> CliError {
    if err.is_invariant() {
        CliError::StateCorruption(err.to_string())
    } else {
        CliError::ProviderRejected(err.to_string())
    }
}
