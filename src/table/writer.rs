//! Table writer: partitioned fixed-width column storage
//!
//! One writer exists per table at any instant (enforced by the writer pool).
//! Rows are buffered, then a commit distributes them into partition
//! directories, appends each column's cells to its `.d` file, persists any
//! newly interned symbols and advances the `_txn` counter.

use crate::column_version::{ColumnVersionWriter, COL_TOP_DEFAULT_PARTITION};
use crate::config::{CommitMode, PartitionBy};
use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::table::meta::{ColumnType, TableMeta, TxnFile};
use crate::table::token::TableToken;
use ahash::AHashMap;
use std::path::{Path, PathBuf};

pub const NULL_INT: i32 = i32::MIN;
pub const NULL_LONG: i64 = i64::MIN;
pub const NULL_SYMBOL_KEY: i32 = -1;

/// One cell of an ingested row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Timestamp(i64),
    Symbol(String),
}

pub type Row = Vec<Value>;

/// Encode one cell; symbol cells arrive pre-resolved to their key.
pub(crate) fn encode_cell(
    out: &mut Vec<u8>,
    col_type: ColumnType,
    value: &Value,
    symbol_key: i32,
) -> Result<()> {
    match (col_type, value) {
        (ColumnType::Boolean, Value::Boolean(v)) => out.push(u8::from(*v)),
        (ColumnType::Boolean, Value::Null) => out.push(0),
        (ColumnType::Int, Value::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Int, Value::Null) => out.extend_from_slice(&NULL_INT.to_le_bytes()),
        (ColumnType::Long, Value::Long(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Long, Value::Null) => out.extend_from_slice(&NULL_LONG.to_le_bytes()),
        (ColumnType::Double, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Double, Value::Null) => out.extend_from_slice(&f64::NAN.to_le_bytes()),
        (ColumnType::Timestamp, Value::Timestamp(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ColumnType::Timestamp, Value::Null) => out.extend_from_slice(&NULL_LONG.to_le_bytes()),
        (ColumnType::Symbol, Value::Symbol(_)) | (ColumnType::Symbol, Value::Null) => {
            out.extend_from_slice(&symbol_key.to_le_bytes())
        }
        (expected, got) => {
            return Err(EngineError::Serde(format!(
                "value {got:?} does not fit column type {expected:?}"
            )))
        }
    }
    Ok(())
}

/// Decode one raw cell; symbol cells come back as their key wrapped in
/// `Value::Int` for the caller to resolve through the dictionary.
pub(crate) fn decode_cell(col_type: ColumnType, bytes: &[u8]) -> Value {
    match col_type {
        ColumnType::Boolean => Value::Boolean(bytes[0] != 0),
        ColumnType::Int | ColumnType::Symbol => {
            let v = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
            if col_type == ColumnType::Int && v == NULL_INT {
                Value::Null
            } else {
                Value::Int(v)
            }
        }
        ColumnType::Long => {
            let v = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
            if v == NULL_LONG {
                Value::Null
            } else {
                Value::Long(v)
            }
        }
        ColumnType::Timestamp => {
            let v = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
            if v == NULL_LONG {
                Value::Null
            } else {
                Value::Timestamp(v)
            }
        }
        ColumnType::Double => {
            let v = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
            if v.is_nan() {
                Value::Null
            } else {
                Value::Double(v)
            }
        }
    }
}

/// Interned-string dictionary for one symbol column. The table-side copy is
/// persisted to an append-only `<column>.k` file of length-prefixed UTF-8.
#[derive(Debug, Default)]
pub(crate) struct SymbolDict {
    map: AHashMap<String, i32>,
    list: Vec<String>,
}

impl SymbolDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> i32 {
        self.list.len() as i32
    }

    pub fn intern(&mut self, symbol: &str) -> i32 {
        if let Some(key) = self.map.get(symbol) {
            return *key;
        }
        let key = self.list.len() as i32;
        self.map.insert(symbol.to_string(), key);
        self.list.push(symbol.to_string());
        key
    }

    pub fn get(&self, key: i32) -> Option<&str> {
        if key < 0 {
            return None;
        }
        self.list.get(key as usize).map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.list
    }

    pub fn load(ff: &FilesFacade, path: &Path) -> Result<Self> {
        let mut dict = Self::new();
        if !ff.exists(path) {
            return Ok(dict);
        }
        let bytes = ff.read(path)?;
        let mut pos = 0usize;
        while pos + 4 <= bytes.len() {
            let len = i32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                return Err(EngineError::Corrupt {
                    path: path.to_path_buf(),
                    detail: format!("truncated symbol key file at {pos}"),
                });
            }
            let symbol = std::str::from_utf8(&bytes[pos..pos + len]).map_err(|e| {
                EngineError::Corrupt {
                    path: path.to_path_buf(),
                    detail: format!("invalid utf-8 symbol: {e}"),
                }
            })?;
            dict.intern(symbol);
            pos += len;
        }
        Ok(dict)
    }

    /// Append entries `[from..]` to the key file.
    pub fn persist_from(&self, ff: &FilesFacade, path: &Path, from: usize) -> Result<()> {
        if from >= self.list.len() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for symbol in &self.list[from..] {
            buf.extend_from_slice(&(symbol.len() as i32).to_le_bytes());
            buf.extend_from_slice(symbol.as_bytes());
        }
        let mut file = ff.open_rw(path)?;
        let len = ff.length(path)?;
        ff.write_at(&mut file, len, &buf)?;
        ff.fdatasync(&file)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Partition {
    pub timestamp: i64,
    pub name: String,
    pub row_count: u64,
}

pub(crate) fn symbol_key_path(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join(format!("{column}.k"))
}

pub(crate) fn column_data_path(partition_dir: &Path, column: &str) -> PathBuf {
    partition_dir.join(format!("{column}.d"))
}

/// Discover partitions from the directory layout. Row counts derive from the
/// first column's file length; creation columns are never truncated by a
/// column top, so the first column is authoritative.
pub(crate) fn scan_partitions(
    ff: &FilesFacade,
    table_dir: &Path,
    meta: &TableMeta,
) -> Result<Vec<Partition>> {
    let col0 = &meta.columns[0];
    let mut partitions = Vec::new();
    let entries = std::fs::read_dir(table_dir)
        .map_err(|e| EngineError::io(format!("read_dir {}", table_dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io("read_dir entry", e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(timestamp) = meta.partition_by.parse_dir_name(&name) else {
            continue; // wal<N>, seq, or foreign directories
        };
        let data = column_data_path(&entry.path(), &col0.name);
        let row_count = if ff.exists(&data) {
            ff.length(&data)? / col0.col_type.fixed_size() as u64
        } else {
            0
        };
        partitions.push(Partition {
            timestamp,
            name,
            row_count,
        });
    }
    partitions.sort_by_key(|p| p.timestamp);
    Ok(partitions)
}

/// Single writer for one table.
pub struct TableWriter {
    ff: FilesFacade,
    token: TableToken,
    dir: PathBuf,
    commit_mode: CommitMode,
    meta: TableMeta,
    txn: TxnFile,
    cv: ColumnVersionWriter,
    partitions: Vec<Partition>,
    symbols: Vec<Option<SymbolDict>>,
    buffer: Vec<Row>,
}

impl TableWriter {
    /// Lay down the on-disk skeleton of a fresh table: `_meta`, `_txn` and an
    /// empty `_cv`.
    pub fn create(ff: &FilesFacade, table_dir: &Path, meta: &TableMeta) -> Result<()> {
        ff.mkdirs(table_dir)?;
        meta.write(ff, table_dir)?;
        TxnFile {
            writer_txn: 0,
            metadata_version: meta.metadata_version,
        }
        .write(ff, table_dir)?;
        ColumnVersionWriter::open(*ff, &table_dir.join(super::CV_FILE_NAME))?;
        Ok(())
    }

    pub fn open(
        ff: FilesFacade,
        commit_mode: CommitMode,
        token: TableToken,
        table_dir: &Path,
    ) -> Result<Self> {
        let meta = TableMeta::read(&ff, table_dir)?;
        let txn = TxnFile::read(&ff, table_dir)?;
        let cv = ColumnVersionWriter::open(ff, &table_dir.join(super::CV_FILE_NAME))?;
        let partitions = scan_partitions(&ff, table_dir, &meta)?;
        let mut symbols = Vec::with_capacity(meta.columns.len());
        for col in &meta.columns {
            if col.col_type == ColumnType::Symbol {
                symbols.push(Some(SymbolDict::load(
                    &ff,
                    &symbol_key_path(table_dir, &col.name),
                )?));
            } else {
                symbols.push(None);
            }
        }
        Ok(Self {
            ff,
            token,
            dir: table_dir.to_path_buf(),
            commit_mode,
            meta,
            txn,
            cv,
            partitions,
            symbols,
            buffer: Vec::new(),
        })
    }

    pub fn token(&self) -> &TableToken {
        &self.token
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn writer_txn(&self) -> i64 {
        self.txn.writer_txn
    }

    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count).sum()
    }

    fn row_timestamp(&self, row: &Row) -> i64 {
        match self.meta.timestamp_index {
            Some(i) => match row[i] {
                Value::Timestamp(ts) => ts,
                _ => NULL_LONG,
            },
            None => 0,
        }
    }

    pub fn append_row(&mut self, row: Row) -> Result<()> {
        if row.len() != self.meta.columns.len() {
            return Err(EngineError::Serde(format!(
                "row has {} values, table {} has {} columns",
                row.len(),
                self.token.table_name(),
                self.meta.columns.len()
            )));
        }
        if self.meta.timestamp_index.is_some() && self.row_timestamp(&row) == NULL_LONG {
            return Err(EngineError::Serde(
                "designated timestamp must not be null".into(),
            ));
        }
        self.buffer.push(row);
        Ok(())
    }

    fn partition_index(&mut self, timestamp: i64) -> Result<usize> {
        let floor = self.meta.partition_by.floor(timestamp);
        if let Some(i) = self.partitions.iter().position(|p| p.timestamp == floor) {
            return Ok(i);
        }
        let name = self.meta.partition_by.dir_name(floor);
        self.ff.mkdirs(&self.dir.join(&name))?;
        let partition = Partition {
            timestamp: floor,
            name,
            row_count: 0,
        };
        let pos = self
            .partitions
            .partition_point(|p| p.timestamp < floor);
        self.partitions.insert(pos, partition);
        Ok(pos)
    }

    /// Flush buffered rows into partition storage and advance the txn.
    /// Returns the new writer txn (unchanged when nothing was buffered).
    pub fn commit(&mut self) -> Result<i64> {
        if self.buffer.is_empty() {
            return Ok(self.txn.writer_txn);
        }
        let rows = std::mem::take(&mut self.buffer);
        let symbol_watermarks: Vec<Option<usize>> = self
            .symbols
            .iter()
            .map(|d| d.as_ref().map(|d| d.entries().len()))
            .collect();

        // (partition timestamp, column index) -> pending cell bytes. Keyed
        // by timestamp: the partition list may grow mid-loop.
        let mut pending: AHashMap<(i64, usize), Vec<u8>> = AHashMap::new();
        let mut appended: AHashMap<i64, u64> = AHashMap::new();
        let mut cv_dirty = false;

        for row in &rows {
            let ts = self.row_timestamp(row);
            let pi = self.partition_index(ts)?;
            let part_ts = self.partitions[pi].timestamp;
            for (ci, value) in row.iter().enumerate() {
                let col_type = self.meta.columns[ci].col_type;
                let key = match (col_type, value) {
                    (ColumnType::Symbol, Value::Symbol(s)) => {
                        self.symbols[ci].as_mut().expect("symbol dict").intern(s)
                    }
                    (ColumnType::Symbol, _) => NULL_SYMBOL_KEY,
                    _ => 0,
                };
                // First value for a column this partition never saw: record
                // the column top so earlier rows read as null.
                if self.cv.column_top(part_ts, ci as i64) < 0 {
                    let top = self.partitions[pi].row_count as i64
                        + appended.get(&part_ts).copied().unwrap_or(0) as i64;
                    self.cv.upsert(part_ts, ci as i64, 0, top);
                    cv_dirty = true;
                }
                encode_cell(
                    pending.entry((part_ts, ci)).or_default(),
                    col_type,
                    value,
                    key,
                )?;
            }
            *appended.entry(part_ts).or_insert(0) += 1;
        }

        // Append cell buffers to the column files.
        let sync = self.commit_mode == CommitMode::Sync;
        for ((part_ts, ci), bytes) in &pending {
            let partition = self
                .partitions
                .iter()
                .find(|p| p.timestamp == *part_ts)
                .expect("partition registered above");
            let path = column_data_path(
                &self.dir.join(&partition.name),
                &self.meta.columns[*ci].name,
            );
            let mut file = self.ff.open_rw(&path)?;
            let len = file
                .metadata()
                .map_err(|e| EngineError::io("stat column", e))?
                .len();
            self.ff.write_at(&mut file, len, bytes)?;
            if sync {
                self.ff.fdatasync(&file)?;
            }
        }
        for (part_ts, added) in appended {
            if let Some(p) = self.partitions.iter_mut().find(|p| p.timestamp == part_ts) {
                p.row_count += added;
            }
        }

        // Persist symbols interned by this commit.
        for (ci, watermark) in symbol_watermarks.iter().enumerate() {
            if let (Some(from), Some(dict)) = (watermark, self.symbols[ci].as_ref()) {
                dict.persist_from(
                    &self.ff,
                    &symbol_key_path(&self.dir, &self.meta.columns[ci].name),
                    *from,
                )?;
            }
        }

        if cv_dirty {
            self.cv.commit()?;
        }
        self.txn.writer_txn += 1;
        self.txn.write(&self.ff, &self.dir)?;
        Ok(self.txn.writer_txn)
    }

    /// Discard buffered rows without touching storage.
    pub fn rollback(&mut self) {
        self.buffer.clear();
    }

    /// Append a column to the schema. Rows already present keep their
    /// storage; the column-version index records where the column begins.
    pub fn add_column(&mut self, name: &str, col_type: ColumnType) -> Result<usize> {
        let index = self.meta.add_column(name, col_type).map_err(|err| match err {
            EngineError::ColumnExists { column, .. } => EngineError::ColumnExists {
                table: self.token.table_name().to_string(),
                column,
            },
            other => other,
        })?;
        self.meta.write(&self.ff, &self.dir)?;

        // The active (latest) partition gets an explicit column top equal to
        // its current row count; older partitions report the column absent.
        let introduction = match self.partitions.last() {
            Some(active) => {
                if active.row_count > 0 {
                    self.cv
                        .upsert(active.timestamp, index as i64, 0, active.row_count as i64);
                }
                active.timestamp
            }
            None => COL_TOP_DEFAULT_PARTITION + 1,
        };
        self.cv.register_column(index as i64, 0, introduction);
        self.cv.commit()?;

        self.symbols.push(if col_type == ColumnType::Symbol {
            Some(SymbolDict::new())
        } else {
            None
        });
        self.txn.metadata_version = self.meta.metadata_version;
        self.txn.write(&self.ff, &self.dir)?;
        Ok(index)
    }

    /// Drop all rows. Partition directories are removed; the schema and
    /// symbol dictionaries stay.
    pub fn truncate(&mut self) -> Result<i64> {
        self.buffer.clear();
        for partition in std::mem::take(&mut self.partitions) {
            self.ff.remove_dir_all(&self.dir.join(&partition.name))?;
        }
        let stale: Vec<i64> = self
            .cv
            .records()
            .iter()
            .map(|r| r.partition_timestamp)
            .filter(|ts| *ts != COL_TOP_DEFAULT_PARTITION)
            .collect();
        for ts in stale {
            self.cv.remove_partition(ts);
        }
        self.cv.commit()?;
        self.txn.writer_txn += 1;
        self.txn.write(&self.ff, &self.dir)?;
        Ok(self.txn.writer_txn)
    }

    /// Writer-side recovery hook run when a reader open failed and the engine
    /// attempts a repair: reconcile the partition list with the directory.
    pub fn repair(&mut self) -> Result<()> {
        self.partitions = scan_partitions(&self.ff, &self.dir, &self.meta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MICROS_PER_DAY;
    use crate::table::meta::ColumnMeta;
    use tempfile::TempDir;

    fn day_table(dir: &Path) -> TableWriter {
        let ff = FilesFacade::new();
        let meta = TableMeta::new(
            1,
            false,
            PartitionBy::Day,
            vec![
                ColumnMeta::new("a", ColumnType::Int),
                ColumnMeta::new("ts", ColumnType::Timestamp),
            ],
        );
        TableWriter::create(&ff, dir, &meta).unwrap();
        let token = TableToken::new("t", "t", 1, false, false);
        TableWriter::open(ff, CommitMode::Sync, token, dir).unwrap()
    }

    #[test]
    fn test_commit_distributes_rows_across_partitions() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let mut writer = day_table(&dir);

        let day0 = 1_704_067_200_000_000; // 2024-01-01
        writer
            .append_row(vec![Value::Int(1), Value::Timestamp(day0)])
            .unwrap();
        writer
            .append_row(vec![Value::Int(2), Value::Timestamp(day0 + MICROS_PER_DAY)])
            .unwrap();
        writer
            .append_row(vec![Value::Int(3), Value::Timestamp(day0 + 1)])
            .unwrap();
        assert_eq!(writer.commit().unwrap(), 1);

        assert_eq!(writer.row_count(), 3);
        assert!(dir.join("2024-01-01").join("a.d").exists());
        assert!(dir.join("2024-01-02").join("a.d").exists());
        // Two rows landed in the first partition.
        assert_eq!(
            std::fs::metadata(dir.join("2024-01-01").join("a.d")).unwrap().len(),
            8
        );
    }

    #[test]
    fn test_add_column_sets_column_top() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let mut writer = day_table(&dir);

        let day0 = 1_704_067_200_000_000;
        for i in 0..10 {
            writer
                .append_row(vec![Value::Int(i), Value::Timestamp(day0 + i as i64)])
                .unwrap();
        }
        writer.commit().unwrap();

        let idx = writer.add_column("b", ColumnType::Double).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(writer.cv.column_top(day0, 2), 10);
        assert_eq!(writer.meta().metadata_version, 1);

        // New rows carry the column; file holds only post-top cells.
        writer
            .append_row(vec![
                Value::Int(11),
                Value::Timestamp(day0 + 100),
                Value::Double(1.5),
            ])
            .unwrap();
        writer.commit().unwrap();
        assert_eq!(
            std::fs::metadata(dir.join("2024-01-01").join("b.d")).unwrap().len(),
            8
        );
    }

    #[test]
    fn test_symbol_interning_persists() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let ff = FilesFacade::new();
        let meta = TableMeta::new(
            1,
            false,
            PartitionBy::None,
            vec![
                ColumnMeta::new("sym", ColumnType::Symbol),
                ColumnMeta::new("price", ColumnType::Double),
            ],
        );
        TableWriter::create(&ff, &dir, &meta).unwrap();
        let token = TableToken::new("t", "t", 1, false, false);
        let mut writer = TableWriter::open(ff, CommitMode::Sync, token.clone(), &dir).unwrap();

        writer
            .append_row(vec![Value::Symbol("EURUSD".into()), Value::Double(1.1)])
            .unwrap();
        writer
            .append_row(vec![Value::Symbol("GBPUSD".into()), Value::Double(1.3)])
            .unwrap();
        writer
            .append_row(vec![Value::Symbol("EURUSD".into()), Value::Double(1.2)])
            .unwrap();
        writer.commit().unwrap();

        // Reopen: dictionary reloads from the .k file with stable keys.
        drop(writer);
        let mut writer = TableWriter::open(FilesFacade::new(), CommitMode::Sync, token, &dir).unwrap();
        let dict = writer.symbols[0].as_mut().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.intern("EURUSD"), 0);
        assert_eq!(dict.intern("GBPUSD"), 1);
    }

    #[test]
    fn test_truncate_removes_partitions() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let mut writer = day_table(&dir);

        let day0 = 1_704_067_200_000_000;
        writer
            .append_row(vec![Value::Int(1), Value::Timestamp(day0)])
            .unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.row_count(), 1);

        writer.truncate().unwrap();
        assert_eq!(writer.row_count(), 0);
        assert!(!dir.join("2024-01-01").exists());
        assert_eq!(writer.writer_txn(), 2);
    }
}
