//! Crate-wide error type and result alias.

use std::io;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the storage and query engine.
///
/// The variants are kinds, not call sites: the same kind can be produced by
/// several layers. Fatal-at-open kinds (`InvalidDatabase`,
/// `IncompatibleLockFile`, `IncompatibleHistories`,
/// `FileFormatUpgradeRequired`) abort `Database::open`; everything else is
/// returned to the caller without tearing down the database.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O failure from the backing file, the lock file, or a sidecar.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The file is not a valid database (bad magic, unrecoverable top ref).
    #[error("invalid database: {0}")]
    InvalidDatabase(String),
    /// The lock file was created by an incompatible library version.
    #[error("incompatible lock file: {0}")]
    IncompatibleLockFile(String),
    /// The on-disk history type does not match the requested one.
    #[error("incompatible histories: stored type {stored}, requested {requested}")]
    IncompatibleHistories {
        /// History type found in the file.
        stored: u64,
        /// History type the caller asked for.
        requested: u64,
    },
    /// The file uses an older format and upgrading was not allowed.
    #[error("file format {0} requires upgrade")]
    FileFormatUpgradeRequired(u16),
    /// An accessor outlived its snapshot or its owning object.
    #[error("stale accessor: {0}")]
    StaleAccessor(&'static str),
    /// A column key does not refer to a live column of the table.
    #[error("invalid column key")]
    InvalidColumnKey,
    /// API misuse detected by argument validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation attempted in the wrong transaction stage.
    #[error("wrong transaction state: {0}")]
    WrongTransactState(&'static str),
    /// `start_read` asked for a version that has been reaped.
    #[error("version {0} is no longer available")]
    BadVersion(u64),
    /// Allocator or arena exhaustion.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// A page failed HMAC verification against both IV slots.
    #[error("decryption failed: page {0}")]
    DecryptionFailed(u64),
    /// Structural operation on the wrong collection type.
    #[error("illegal operation: {0}")]
    IllegalOperation(&'static str),
    /// A value does not fit the array's current element width.
    #[error("value {value} does not fit width {width}")]
    WidthOverflow {
        /// Value that failed to fit.
        value: i64,
        /// Current element width in bits.
        width: u8,
    },
    /// On-disk structure violates an invariant.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Compression frame names an algorithm this build cannot decode.
    #[error("unsupported compression algorithm {0}")]
    UnsupportedCompression(u8),
}

impl CoreError {
    /// True when the error makes the open attempt unrecoverable.
    pub fn is_fatal_at_open(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDatabase(_)
                | CoreError::IncompatibleLockFile(_)
                | CoreError::IncompatibleHistories { .. }
                | CoreError::FileFormatUpgradeRequired(_)
        )
    }
}
