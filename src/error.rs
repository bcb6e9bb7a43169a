//! Error types for the tempora storage engine

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("table does not exist [table={0}]")]
    TableDoesNotExist(String),

    #[error("table already exists [table={0}]")]
    TableExists(String),

    #[error("table name is reserved [table={0}]")]
    NameReserved(String),

    #[error("invalid table name [name={0}]")]
    InvalidTableName(String),

    #[error("column already exists [table={table},column={column}]")]
    ColumnExists { table: String, column: String },

    #[error("not a wal table [table={0}]")]
    NotWalTable(String),

    #[error("entry unavailable [table={table},reason={reason}]")]
    EntryUnavailable { table: String, reason: &'static str },

    #[error(
        "table reference out of date [table={table},tableId={expected_id}->{actual_id},version={expected_version}->{actual_version}]"
    )]
    TableReferenceOutOfDate {
        table: String,
        expected_id: i32,
        actual_id: i32,
        expected_version: i64,
        actual_version: i64,
    },

    #[error("checkpoint in progress")]
    CheckpointInProgress,

    #[error("table is suspended [table={0}]")]
    TableSuspended(String),

    #[error("timed out waiting for txn [table={table},txn={txn}]")]
    TxnTimeout { table: String, txn: i64 },

    #[error("critical: {0}")]
    Critical(String),

    #[error("io error: {context} [errno={errno}]")]
    Io {
        context: String,
        errno: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupted file [path={path},detail={detail}]")]
    Corrupt { path: PathBuf, detail: String },

    #[error("serialization error: {0}")]
    Serde(String),
}

impl EngineError {
    /// Build an I/O error with path context and the OS errno.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        let errno = source.raw_os_error().unwrap_or(0);
        EngineError::Io {
            context: context.into(),
            errno,
            source,
        }
    }

    /// Raise a CRITICAL error; logged at the raise site with full context.
    pub fn critical(context: impl Into<String>) -> Self {
        let context = context.into();
        log::error!("CRITICAL: {context}");
        EngineError::Critical(context)
    }

    /// Data-integrity and filesystem failures that may suspend a table.
    /// Everything else is user error or transient contention.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EngineError::Critical(_) | EngineError::Io { .. } | EngineError::Corrupt { .. }
        )
    }

    /// Contention errors callers are expected to retry externally.
    pub fn is_entry_unavailable(&self) -> bool {
        matches!(self, EngineError::EntryUnavailable { .. })
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serde(err.to_string())
    }
}
