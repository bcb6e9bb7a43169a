//! On-disk table metadata
//!
//! `_meta` holds the schema: bincode payload guarded by a trailing CRC32 so a
//! torn write is caught on open rather than surfacing as a garbage schema.
//! `_txn` is the 16-byte transaction counter rewritten after every applied
//! commit; readers compare it against their token to detect staleness.

use crate::config::PartitionBy;
use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column data type. All cells are fixed width on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Int,
    Long,
    Double,
    Timestamp,
    /// Interned string; stored as i32 keys mapped through a per-column
    /// dictionary.
    Symbol,
}

impl ColumnType {
    pub fn fixed_size(&self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Int | ColumnType::Symbol => 4,
            ColumnType::Long | ColumnType::Double | ColumnType::Timestamp => 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub col_type: ColumnType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
        }
    }
}

/// Schema persisted in `_meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub table_id: i32,
    pub wal_enabled: bool,
    pub partition_by: PartitionBy,
    /// Index of the designated timestamp column, if any.
    pub timestamp_index: Option<usize>,
    pub columns: Vec<ColumnMeta>,
    /// Bumped on every structural change (add column).
    pub metadata_version: i64,
}

impl TableMeta {
    pub fn new(
        table_id: i32,
        wal_enabled: bool,
        partition_by: PartitionBy,
        columns: Vec<ColumnMeta>,
    ) -> Self {
        let timestamp_index = columns
            .iter()
            .position(|c| c.col_type == ColumnType::Timestamp);
        Self {
            table_id,
            wal_enabled,
            partition_by,
            timestamp_index,
            columns,
            metadata_version: 0,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Append a column and bump the metadata version. Existing rows are not
    /// rewritten; the column-version index records the column top instead.
    pub fn add_column(&mut self, name: impl Into<String>, col_type: ColumnType) -> Result<usize> {
        let name = name.into();
        if self.column_index(&name).is_some() {
            return Err(EngineError::ColumnExists {
                table: self.table_id.to_string(),
                column: name,
            });
        }
        self.columns.push(ColumnMeta::new(name, col_type));
        self.metadata_version += 1;
        Ok(self.columns.len() - 1)
    }

    /// Serialize: `[len: u32][bincode payload][crc32: u32]`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(out)
    }

    pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(EngineError::Corrupt {
                path: path.to_path_buf(),
                detail: "metadata file too short".into(),
            });
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if bytes.len() < 4 + len + 4 {
            return Err(EngineError::Corrupt {
                path: path.to_path_buf(),
                detail: format!("truncated metadata payload, expected {len} bytes"),
            });
        }
        let payload = &bytes[4..4 + len];
        let stored = u32::from_le_bytes(bytes[4 + len..8 + len].try_into().unwrap());
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(EngineError::Corrupt {
                path: path.to_path_buf(),
                detail: format!("metadata crc mismatch, stored={stored:08x} computed={computed:08x}"),
            });
        }
        Ok(bincode::deserialize(payload)?)
    }

    pub fn write(&self, ff: &FilesFacade, table_dir: &Path) -> Result<()> {
        ff.write_atomic(&table_dir.join(super::META_FILE_NAME), &self.encode()?)
    }

    pub fn read(ff: &FilesFacade, table_dir: &Path) -> Result<Self> {
        let path = table_dir.join(super::META_FILE_NAME);
        let bytes = ff.read(&path)?;
        Self::decode(&path, &bytes)
    }
}

/// The `_txn` counter file: `writer_txn: i64`, `metadata_version: i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnFile {
    pub writer_txn: i64,
    pub metadata_version: i64,
}

impl TxnFile {
    pub fn read(ff: &FilesFacade, table_dir: &Path) -> Result<Self> {
        let path = table_dir.join(super::TXN_FILE_NAME);
        if !ff.exists(&path) {
            return Ok(Self::default());
        }
        let bytes = ff.read(&path)?;
        if bytes.len() < 16 {
            return Err(EngineError::Corrupt {
                path,
                detail: "txn file shorter than 16 bytes".into(),
            });
        }
        Ok(Self {
            writer_txn: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            metadata_version: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        })
    }

    pub fn write(&self, ff: &FilesFacade, table_dir: &Path) -> Result<()> {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&self.writer_txn.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.metadata_version.to_le_bytes());
        ff.write_atomic(&table_dir.join(super::TXN_FILE_NAME), &bytes)
    }
}
