//! Table reader: column-top-aware snapshot reads
//!
//! Readers coexist freely with the single writer. A reader resolves column
//! identities for a partition through the column-version snapshot taken at
//! open; rows above a column's top read as null.

use crate::column_version::{ColumnVersionReader, ColumnVersionSnapshot};
use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::table::meta::{ColumnType, TableMeta, TxnFile};
use crate::table::token::TableToken;
use crate::table::writer::{
    column_data_path, decode_cell, scan_partitions, symbol_key_path, Partition, Row, SymbolDict,
    Value,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct TableReader {
    ff: FilesFacade,
    token: TableToken,
    dir: PathBuf,
    spin_lock_timeout: Duration,
    meta: TableMeta,
    txn: TxnFile,
    cv: ColumnVersionSnapshot,
    partitions: Vec<Partition>,
    symbols: Vec<Option<SymbolDict>>,
}

impl TableReader {
    /// Open a snapshot of the table.
    ///
    /// When `requested_metadata_version` is given and the on-disk state has
    /// moved past it (or the token's table id no longer matches), the caller
    /// holds a stale compiled reference and gets
    /// [`EngineError::TableReferenceOutOfDate`].
    pub fn open(
        ff: FilesFacade,
        token: TableToken,
        table_dir: &Path,
        spin_lock_timeout: Duration,
        requested_metadata_version: Option<i64>,
    ) -> Result<Self> {
        let meta = TableMeta::read(&ff, table_dir)?;
        if meta.table_id != token.table_id() {
            return Err(EngineError::TableReferenceOutOfDate {
                table: token.table_name().to_string(),
                expected_id: token.table_id(),
                actual_id: meta.table_id,
                expected_version: requested_metadata_version.unwrap_or(-1),
                actual_version: meta.metadata_version,
            });
        }
        if let Some(requested) = requested_metadata_version {
            if requested != meta.metadata_version {
                return Err(EngineError::TableReferenceOutOfDate {
                    table: token.table_name().to_string(),
                    expected_id: token.table_id(),
                    actual_id: meta.table_id,
                    expected_version: requested,
                    actual_version: meta.metadata_version,
                });
            }
        }
        let txn = TxnFile::read(&ff, table_dir)?;
        let cv = ColumnVersionReader::open(
            ff,
            &table_dir.join(super::CV_FILE_NAME),
            spin_lock_timeout,
        )?
        .read_safe()?;
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
            spin_lock_timeout,
            meta,
            txn,
            cv,
            partitions,
            symbols,
        })
    }

    /// Refresh the snapshot in place. Called when a warm pooled reader is
    /// checked out again, so it observes commits made since its last use.
    pub fn reload(&mut self) -> Result<()> {
        let meta = TableMeta::read(&self.ff, &self.dir)?;
        let txn = TxnFile::read(&self.ff, &self.dir)?;
        let cv = ColumnVersionReader::open(
            self.ff,
            &self.dir.join(super::CV_FILE_NAME),
            self.spin_lock_timeout,
        )?
        .read_safe()?;
        let partitions = scan_partitions(&self.ff, &self.dir, &meta)?;
        let mut symbols = Vec::with_capacity(meta.columns.len());
        for col in &meta.columns {
            if col.col_type == ColumnType::Symbol {
                symbols.push(Some(SymbolDict::load(
                    &self.ff,
                    &symbol_key_path(&self.dir, &col.name),
                )?));
            } else {
                symbols.push(None);
            }
        }
        self.meta = meta;
        self.txn = txn;
        self.cv = cv;
        self.partitions = partitions;
        self.symbols = symbols;
        Ok(())
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

    /// Column top for the partition containing `partition_timestamp`, via the
    /// snapshot taken at open.
    pub fn column_top(&self, partition_timestamp: i64, column_index: usize) -> i64 {
        self.cv.get_column_top(
            self.meta.partition_by.floor(partition_timestamp),
            column_index as i64,
        )
    }

    pub fn column_version(&self) -> u64 {
        self.cv.version
    }

    /// Materialize every row in partition order. Cells above a column top, or
    /// in partitions the column predates, come back as [`Value::Null`].
    pub fn read_all(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.row_count() as usize);
        for partition in &self.partitions {
            let part_dir = self.dir.join(&partition.name);
            // Load each column file once.
            let mut columns: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.meta.columns.len());
            for col in &self.meta.columns {
                let path = column_data_path(&part_dir, &col.name);
                columns.push(if self.ff.exists(&path) {
                    Some(self.ff.read(&path)?)
                } else {
                    None
                });
            }
            for row_index in 0..partition.row_count {
                let mut row = Vec::with_capacity(self.meta.columns.len());
                for (ci, col) in self.meta.columns.iter().enumerate() {
                    row.push(self.cell(
                        partition,
                        columns[ci].as_deref(),
                        row_index,
                        ci,
                        col.col_type,
                    )?);
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn cell(
        &self,
        partition: &Partition,
        column_data: Option<&[u8]>,
        row_index: u64,
        column_index: usize,
        col_type: ColumnType,
    ) -> Result<Value> {
        let top = self.cv.get_column_top(partition.timestamp, column_index as i64);
        if top < 0 || (row_index as i64) < top {
            return Ok(Value::Null);
        }
        let Some(data) = column_data else {
            return Ok(Value::Null);
        };
        let size = col_type.fixed_size();
        let offset = (row_index - top as u64) as usize * size;
        if offset + size > data.len() {
            return Err(EngineError::Corrupt {
                path: self.dir.join(&partition.name),
                detail: format!(
                    "column {} short: row {row_index} beyond {} bytes",
                    self.meta.columns[column_index].name,
                    data.len()
                ),
            });
        }
        let raw = decode_cell(col_type, &data[offset..offset + size]);
        if col_type == ColumnType::Symbol {
            return Ok(match raw {
                Value::Int(key) => match self.symbols[column_index]
                    .as_ref()
                    .and_then(|d| d.get(key))
                {
                    Some(symbol) => Value::Symbol(symbol.to_string()),
                    None => Value::Null,
                },
                _ => Value::Null,
            });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitMode, PartitionBy, MICROS_PER_DAY};
    use crate::table::meta::ColumnMeta;
    use crate::table::writer::TableWriter;
    use tempfile::TempDir;

    const DAY0: i64 = 1_704_067_200_000_000; // 2024-01-01

    fn build_table(dir: &Path) -> TableToken {
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
        TableToken::new("t", "t", 1, false, false)
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let token = build_table(&dir);

        let mut writer =
            TableWriter::open(FilesFacade::new(), CommitMode::Sync, token.clone(), &dir).unwrap();
        writer
            .append_row(vec![Value::Int(42), Value::Timestamp(DAY0)])
            .unwrap();
        writer
            .append_row(vec![Value::Int(7), Value::Timestamp(DAY0 + MICROS_PER_DAY)])
            .unwrap();
        writer.commit().unwrap();

        let reader = TableReader::open(
            FilesFacade::new(),
            token,
            &dir,
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        assert_eq!(reader.row_count(), 2);
        let rows = reader.read_all().unwrap();
        assert_eq!(rows[0], vec![Value::Int(42), Value::Timestamp(DAY0)]);
        assert_eq!(
            rows[1],
            vec![Value::Int(7), Value::Timestamp(DAY0 + MICROS_PER_DAY)]
        );
    }

    #[test]
    fn test_added_column_reads_null_above_top() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let token = build_table(&dir);

        let mut writer =
            TableWriter::open(FilesFacade::new(), CommitMode::Sync, token.clone(), &dir).unwrap();
        for i in 0..5 {
            writer
                .append_row(vec![Value::Int(i), Value::Timestamp(DAY0 + i as i64)])
                .unwrap();
        }
        writer.commit().unwrap();
        writer.add_column("b", ColumnType::Double).unwrap();
        writer
            .append_row(vec![
                Value::Int(5),
                Value::Timestamp(DAY0 + 50),
                Value::Double(0.5),
            ])
            .unwrap();
        writer.commit().unwrap();

        let reader = TableReader::open(
            FilesFacade::new(),
            token,
            &dir,
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        assert_eq!(reader.column_top(DAY0, 2), 5);
        let rows = reader.read_all().unwrap();
        assert_eq!(rows.len(), 6);
        for row in &rows[..5] {
            assert_eq!(row[2], Value::Null);
        }
        assert_eq!(rows[5][2], Value::Double(0.5));
    }

    #[test]
    fn test_stale_metadata_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("t");
        let token = build_table(&dir);

        let mut writer =
            TableWriter::open(FilesFacade::new(), CommitMode::Sync, token.clone(), &dir).unwrap();
        writer.add_column("b", ColumnType::Long).unwrap();

        let err = TableReader::open(
            FilesFacade::new(),
            token.clone(),
            &dir,
            Duration::from_secs(1),
            Some(0),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::TableReferenceOutOfDate { .. }));

        // Current version opens fine.
        TableReader::open(FilesFacade::new(), token, &dir, Duration::from_secs(1), Some(1))
            .unwrap();
    }
}
