//! Storage tier of a time-series database.
//!
//! Each table keeps its rows in two tiers: immutable, time-ordered blocks on
//! disk and a mutable write buffer in memory, backed by a write-ahead log.
//! Scans merge both tiers into one ordered stream and apply time ranges,
//! predicates, offset and limit lazily. Tables with an SMA configuration also
//! keep per-bucket count/sum/min/max aggregates that always agree with the
//! stored rows.
//!
//! ```no_run
//! use tsdb::{ColumnDef, ColumnType, Engine, EngineConfig, OsDir, Row, ScanRequest, SmaConfig, Value};
//!
//! # fn main() -> anyhow::Result<()> {
//! let db = Engine::open(OsDir::new("/tmp/tsdb")?, EngineConfig::default())?;
//! db.create_super_table(
//!     "meters",
//!     "ts",
//!     vec![ColumnDef::new("current", ColumnType::Double)],
//!     vec![ColumnDef::new("location", ColumnType::Text)],
//!     Some(SmaConfig::new(["current"], 60_000)),
//! )?;
//! db.create_child_table("d1001", "meters", vec![Value::from("sf")])?;
//! db.insert("d1001", vec![Row::new(1_500_000_000_000, [10.3])])?;
//! for row in db.scan("d1001", &ScanRequest::new().limit(10))? {
//!     println!("{}", row?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod catalog;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod fs;
pub mod log;
pub mod memtable;
pub mod root;
pub mod sma;
pub mod types;

pub use crate::{
    catalog::{Catalog, ColumnDef, Schema, TableKind, TableMeta, TagFilter},
    config::{DuplicatePolicy, EngineConfig},
    db::{
        ChildRow, CmpOp, Engine, Predicate, ScanRequest, SuperTableScan, TableScan, TableStats,
    },
    error::{Error, Result},
    fs::{DbDir, MockDir, OsDir},
    sma::{BucketRecord, ColumnAggregate, SmaConfig, SmaSum},
    types::{ColumnType, Order, Row, TimeRange, Timestamp, Value},
};
