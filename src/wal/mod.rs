//! Per-table write-ahead log
//!
//! A WAL-backed table takes writes through a [`WalWriter`] that owns one
//! segment: column files for row data plus a framed `_event` log and its
//! `_event.i` offset index. Committed transactions are merged into table
//! storage by the apply job.

pub mod apply;
pub mod events;
pub mod reader;
pub mod sequencer;
pub mod writer;

pub use apply::WalApplyJob;
pub use events::{BindValue, DataEvent, SqlEvent, SymbolMapDiff, SymbolMapDiffEntry, WalEvent};
pub use reader::WalEventCursor;
pub use sequencer::{SeqTxnTracker, TableSequencerSet};
pub use writer::{WalEventWriter, WalWriter};

/// Event file name inside a segment directory.
pub const EVENT_FILE_NAME: &str = "_event";
/// Offset index file name inside a segment directory.
pub const EVENT_INDEX_FILE_NAME: &str = "_event.i";

/// Directory of WAL `wal_id` under a table directory.
pub fn wal_dir(table_dir: &std::path::Path, wal_id: u32) -> std::path::PathBuf {
    table_dir.join(format!("wal{wal_id}"))
}

/// Directory of one segment.
pub fn segment_dir(table_dir: &std::path::Path, wal_id: u32, segment_id: u32) -> std::path::PathBuf {
    wal_dir(table_dir, wal_id).join(segment_id.to_string())
}
