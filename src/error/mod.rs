//! Errors surfaced by the engine.
//!
//! Storage plumbing below the engine (files, encoding, WAL, block decoding)
//! reports `anyhow` errors; they are attached as the `source` of `DiskIo` or
//! `ScanFailed` together with the table and operation that hit them.

use thiserror::Error;

use crate::types::Timestamp;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request: negative offset/limit, inverted range, unknown
    /// column, schema mismatch. Nothing was done.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("table not found: {name}")]
    TableNotFound { name: String },

    #[error("table already exists: {name}")]
    TableExists { name: String },

    /// A block was handed more rows than the configured block capacity.
    #[error("block for table {table} holds {rows} rows, capacity is {capacity}")]
    CapacityExceeded {
        table: String,
        rows: usize,
        capacity: usize,
    },

    /// Rows handed to a block were not strictly ascending by key.
    #[error("rows for table {table} are out of order at position {position}")]
    OutOfOrder { table: String, position: usize },

    #[error("disk I/O error on table {table} during {op}: {source}")]
    DiskIo {
        table: String,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("scan of table {table} failed: {source}")]
    ScanFailed {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("sma update for table {table} overflowed at ts {ts}")]
    SmaOverflow { table: String, ts: Timestamp },
}

impl Error {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn table_not_found(name: impl Into<String>) -> Self {
        Error::TableNotFound { name: name.into() }
    }

    pub fn disk_io(table: impl Into<String>, op: &'static str, source: anyhow::Error) -> Self {
        Error::DiskIo {
            table: table.into(),
            op,
            source,
        }
    }

    pub fn scan_failed(table: impl Into<String>, source: anyhow::Error) -> Self {
        Error::ScanFailed {
            table: table.into(),
            source,
        }
    }
}
