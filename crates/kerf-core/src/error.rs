//! Error types for the kerf-core library.
//!
//! This module provides comprehensive error handling using the `thiserror` crate,
//! with detailed error variants for different failure modes.
//!
//! Most parsing errors are *recoverable*: during carving, "these bytes are not
//! a record" is the steady-state outcome and must never abort a scan. See
//! [`Error::is_recoverable`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kerf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all kerf operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file does not start with the SQLite header magic
    #[error("'{path}' is not a SQLite database (bad magic)")]
    NotSqlite {
        /// Path to the rejected file
        path: PathBuf,
    },

    /// The database header carries an invalid field
    #[error("invalid database header: {reason}")]
    InvalidDbHeader {
        /// Description of the offending field
        reason: String,
    },

    /// A buffer ended before a complete value could be read
    #[error("truncated data at offset {offset}: declared length exceeds remaining bytes")]
    Truncated {
        /// Byte offset where the underflow occurred
        offset: usize,
    },

    /// A varint ran past the end of its buffer
    #[error("failed to decode varint at offset {offset}: buffer too small or invalid encoding")]
    VarintOverrun {
        /// Byte offset where the error occurred
        offset: usize,
    },

    /// A serial-type code outside the defined mapping (10, 11, or garbage)
    #[error("unknown serial type code {code}")]
    UnknownSerialType {
        /// The unmapped code
        code: u64,
    },

    /// A page number outside `1..=page_count`
    #[error("page {page} out of range (database has {count} pages)")]
    PageOutOfRange {
        /// The invalid page number
        page: u32,
        /// Total pages in the database
        count: u32,
    },

    /// An overflow chain revisited a page it already consumed
    #[error("overflow chain cycle detected at page {page}")]
    OverflowCycle {
        /// The revisited page number
        page: u32,
    },

    /// A record header that cannot describe a record (zero length, impossible size)
    #[error("invalid record header: {reason}")]
    InvalidRecordHeader {
        /// Description of the structural problem
        reason: String,
    },

    /// The supplied schema contains no descriptors
    #[error("schema contains no table or index descriptors")]
    EmptySchema,

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new not-a-SQLite-file error
    pub fn not_sqlite(path: impl Into<PathBuf>) -> Self {
        Self::NotSqlite { path: path.into() }
    }

    /// Creates a new invalid database header error
    pub fn invalid_db_header(reason: impl Into<String>) -> Self {
        Self::InvalidDbHeader {
            reason: reason.into(),
        }
    }

    /// Creates a new truncated-data error
    pub fn truncated(offset: usize) -> Self {
        Self::Truncated { offset }
    }

    /// Creates a new varint decode error
    pub fn varint_overrun(offset: usize) -> Self {
        Self::VarintOverrun { offset }
    }

    /// Creates a new unknown serial type error
    pub fn unknown_serial_type(code: u64) -> Self {
        Self::UnknownSerialType { code }
    }

    /// Creates a new page-out-of-range error
    pub fn page_out_of_range(page: u32, count: u32) -> Self {
        Self::PageOutOfRange { page, count }
    }

    /// Creates a new overflow cycle error
    pub fn overflow_cycle(page: u32) -> Self {
        Self::OverflowCycle { page }
    }

    /// Creates a new invalid record header error
    pub fn invalid_record_header(reason: impl Into<String>) -> Self {
        Self::InvalidRecordHeader {
            reason: reason.into(),
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error only invalidates the current record candidate.
    ///
    /// Recoverable errors make the caller abandon the candidate and continue
    /// scanning; they never surface to the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::VarintOverrun { .. }
                | Self::UnknownSerialType { .. }
                | Self::PageOutOfRange { .. }
                | Self::OverflowCycle { .. }
                | Self::InvalidRecordHeader { .. }
        )
    }
}
