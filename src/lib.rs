//! tempora storage engine
//!
//! Core of a column-oriented time-series database: coordinates concurrent
//! readers and writers over a set of on-disk tables, enforces single-writer-
//! per-table discipline, and keeps metadata changes crash-consistent.
//!
//! ## Architecture
//! - Registry: authoritative name-to-token mapping, persisted append-then-
//!   compact in `tables.d`
//! - Storage: partitioned fixed-width column files, per-table `_meta` /
//!   `_txn` / `_cv` state
//! - WAL: per-table framed event log with symbol-dictionary diffs; an apply
//!   job merges committed transactions into table storage
//! - Concurrency: pooled writers/readers/metadata handles with fail-fast
//!   acquisition, a seqlock-protected column-version index, and a bounded
//!   message bus feeding the background jobs

pub mod bus;
pub mod checkpoint;
pub mod column_version;
pub mod config;
pub mod engine;
pub mod fs;
pub mod mat_view;
pub mod pool;
pub mod table;
pub mod wal;

mod error;

pub use config::{CommitMode, EngineConfig, PartitionBy};
pub use engine::{CreateTableOp, Engine};
pub use error::{EngineError, Result};

pub use checkpoint::REASON_CHECKPOINT_IN_PROGRESS;
pub use table::{ColumnMeta, ColumnType, Row, TableToken, Value};
