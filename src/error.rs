use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Malformed,
    TooLarge,
    Rejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Malformed => write!(f, "malformed"),
            FailureKind::TooLarge => write!(f, "too large"),
            FailureKind::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum VaultError {
    #[error("invalid country code: {0}")]
    InvalidCountryCode(String),

    #[error("invalid admin level: {0}")]
    InvalidLevel(String),

    #[error("no countries specified (pass --countries or --all-countries)")]
    MissingCountries,

    #[error("no admin levels specified (pass --levels or --all-levels)")]
    MissingLevels,

    #[error("at least two overpass endpoints are required, got {0}")]
    TooFewEndpoints(usize),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("overpass client setup failed: {0}")]
    ClientSetup(String),

    #[error("overpass request failed at {endpoint} ({kind}): {message}")]
    FetchFailed {
        endpoint: String,
        kind: FailureKind,
        message: String,
    },

    #[error(
        "chunked fetch for {country} level {level} found no parent relations at level {parent_level}"
    )]
    ChunkPartition {
        country: String,
        level: u32,
        parent_level: u32,
    },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("corrupt backup record {path}: {message}")]
    CorruptRecord { path: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{failed} of {total} targets failed")]
    PartialRun { failed: usize, total: usize },
}

impl VaultError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            VaultError::FetchFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
