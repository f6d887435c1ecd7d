//! # Error Types
//!
//! Defines a structured error hierarchy for the storage core using `thiserror`.
//! Variants are grouped the way the design classifies failures: user-input,
//! catalog-state, invariant, backend-transient, backend-permanent, and
//! integrity errors each carry enough context for meaningful diagnostics
//! without exposing internal implementation details to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the storage core.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    UserInput(#[from] UserInputError),

    #[error(transparent)]
    CatalogState(#[from] CatalogStateError),

    #[error(transparent)]
    Invariant(#[from] InvariantError),

    #[error("backend request failed, will retry: {0}")]
    BackendTransient(String),

    #[error("backend request failed permanently: {0}")]
    BackendPermanent(String),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("volume container error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found (searched: {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {message}")]
    Validation { message: String },
}

/// Errors that are the caller's fault and must fail fast with no side effects.
#[derive(Error, Debug)]
pub enum UserInputError {
    #[error("an empty filter would purge every file in the fileset; refusing")]
    EmptyFilterPurgeNotAllowed,

    #[error("no filesets matched the requested version/time selection")]
    NoMatchingVersions,

    #[error("catalog database not found at {0}")]
    CatalogMissing(PathBuf),

    #[error("restore target {0} already exists and is not empty; pass --force to overwrite")]
    TargetNotEmpty(PathBuf),
}

/// Errors caused by the catalog being in a state that forbids the requested operation.
#[derive(Error, Debug)]
pub enum CatalogStateError {
    #[error("catalog at {0} is partially recreated; run `repair` before purge/compact")]
    PartiallyRecreated(PathBuf),

    #[error("catalog is mid-repair; cannot start a purge or compact concurrently")]
    MidRepair,

    #[error("{count} orphan file(s) exist; purge/compact preconditions require zero")]
    OrphanFilesPresent { count: i64 },

    #[error("catalog is locked by another process: {0}")]
    Locked(PathBuf),
}

/// Internal invariant violations — always fatal, never retried.
#[derive(Error, Debug)]
pub enum InvariantError {
    #[error(
        "probed timestamp {candidate} is not strictly before the next-newer fileset ({next_newer}); \
         remove the interfering volume or choose different versions"
    )]
    TimestampCollision {
        candidate: chrono::DateTime<chrono::Utc>,
        next_newer: chrono::DateTime<chrono::Utc>,
    },

    #[error("remote volume {id} cannot transition from {from:?} to {to:?}")]
    IllegalStateTransition {
        id: i64,
        from: crate::model::VolumeState,
        to: crate::model::VolumeState,
    },

    #[error("block ({hash}, {size}) collides with an existing block of a different size")]
    BlockHashSizeCollision { hash: String, size: u64 },

    #[error("fileset timestamps are not strictly monotonic: {0} is not after {1}")]
    NonMonotonicFileset(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>),

    #[error("referential integrity violated: {0}")]
    Referential(String),
}

/// Errors surfaced by the consistency verifier.
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("blob missing from backend: {name}")]
    BlobMissing { name: String },

    #[error("blob size mismatch for {name}: catalog says {expected}, backend has {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("unexpected blob present on backend with no catalog row: {name}")]
    ExtraBlob { name: String },

    #[error("block {hash} is referenced in volume {volume} but absent from its decoded contents")]
    BlockMissingFromVolume { hash: String, volume: String },

    #[error("restored content for {path} does not match its recorded hash (expected {expected}, got {actual})")]
    ContentMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: invalid key length")]
    InvalidKeyLength,

    #[error("decryption failed: authentication tag mismatch (corrupted or wrong key)")]
    DecryptionFailed,
}

pub type Result<T> = std::result::Result<T, CoreError>;
