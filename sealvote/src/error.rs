use crate::*;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("sealvote: blob {0} not found")]
    BlobNotFound(BlobId),

    #[error("sealvote: election {0} not found")]
    ElectionNotFound(ElectionId),

    #[error("sealvote: ledger reference {0} not found")]
    ReferenceNotFound(ReferenceId),

    #[error("sealvote: user has already voted in election {0}")]
    AlreadyVoted(ElectionId),

    #[error("sealvote: election {0} is not open for voting")]
    ElectionNotOpen(ElectionId),

    #[error("sealvote: invalid option: {0}")]
    InvalidOption(String),

    #[error("sealvote: election {election} expects {expected} ballots")]
    ChoiceModeMismatch {
        election: ElectionId,
        expected: ChoiceMode,
    },

    /// The AEAD tag did not verify: the envelope is truncated, corrupted or tampered with.
    #[error("sealvote: envelope authentication failed")]
    AuthenticationFailure,

    #[error("sealvote: integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("sealvote: malformed key: {0}")]
    KeyFormatError(String),

    #[error("sealvote: private key does not belong to election {0}")]
    KeyMismatch(ElectionId),

    #[error("sealvote: ledger unavailable: {operation} failed after {attempts} attempt(s): {reason}")]
    LedgerUnavailable {
        operation: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("sealvote: ledger rejected {operation}: {reason}")]
    LedgerRejected {
        operation: &'static str,
        reason: String,
    },

    #[error("sealvote: election {election} cannot move from {from} to {to}")]
    InvalidTransition {
        election: ElectionId,
        from: ElectionStatus,
        to: ElectionStatus,
    },

    #[error("sealvote: invalid election: {0}")]
    InvalidElection(String),

    #[error("sealvote: invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("sealvote: keystore error: {0}")]
    Keystore(String),

    #[error("sealvote: failed to encrypt payload")]
    EncryptionFailure,

    #[error("sealvote: RSA error: {0}")]
    RSAError(#[from] rsa::Error),

    #[error("sealvote: JSON error: {0}")]
    JSON(#[from] serde_json::Error),

    #[error("sealvote: IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl Error {
    /// True when the ledger could not be reached at all.
    pub fn is_ledger_unavailable(&self) -> bool {
        matches!(self, Error::LedgerUnavailable { .. })
    }
}
