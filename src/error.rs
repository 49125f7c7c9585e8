use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while recognising a single image.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write image {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("reference directory not found: {0}")]
    MissingReferenceRoot(PathBuf),

    #[error("no valid reference images found in {0}")]
    EmptyReferenceSet(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Errors raised by the reference cache. Every one of them is recoverable by
/// a rebuild; callers log and continue.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot is not a card-match cache file")]
    BadMagic,

    #[error("snapshot schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("snapshot payload is corrupt: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// Errors raised by the metadata connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("metadata database not found: {0}")]
    MissingDatabase(PathBuf),

    #[error("timed out waiting for a metadata connection")]
    Timeout,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T, E = RecognitionError> = std::result::Result<T, E>;
