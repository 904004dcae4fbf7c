use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Rejection reasons of the commit pipeline, in validation order. The wire
/// code of each variant is part of the client contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("creator not found or inactive")]
    CreatorMissing,
    #[error("signature does not verify under the creator's public key")]
    SignatureInvalid,
    #[error("block hash does not satisfy the difficulty target")]
    PowFailed,
    #[error("recomputed hash does not match the submitted block_hash")]
    HashMismatch,
    #[error("malformed block payload: {0}")]
    ShapeInvalid(String),
    #[error("chain tip moved; re-run prepare-mining against the new tip")]
    TipMoved,
}

impl CommitError {
    pub fn code(&self) -> &'static str {
        match self {
            CommitError::CreatorMissing => "creator-missing",
            CommitError::SignatureInvalid => "signature-invalid",
            CommitError::PowFailed => "pow-failed",
            CommitError::HashMismatch => "hash-mismatch",
            CommitError::ShapeInvalid(_) => "shape-invalid",
            CommitError::TipMoved => "tip-moved",
        }
    }
}
