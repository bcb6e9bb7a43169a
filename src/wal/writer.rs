//! WAL event-log and segment writers
//!
//! Append protocol invariant: the previous record's trailing `next_len` slot
//! sits at `append_offset - 4` and becomes the new record's length slot. The
//! length patch is the commit point; the trailing placeholder and the index
//! entry are written (and, under `CommitMode::Sync`, flushed) first so a
//! crash between the two leaves an uncommitted record, never a torn frame.

use crate::config::CommitMode;
use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::table::meta::{ColumnType, TableMeta};
use crate::table::token::TableToken;
use crate::table::writer::{encode_cell, Row, SymbolDict, Value, NULL_LONG, NULL_SYMBOL_KEY};
use crate::wal::events::{
    put_i64, DataEvent, SqlEvent, SymbolMapDiff, SymbolMapDiffEntry, WalEvent, WalTxnType,
    WALE_HEADER_SIZE, WALE_MAX_TXN_OFFSET_32, WAL_FORMAT_OFFSET_32, WAL_FORMAT_VERSION,
    WAL_FORMAT_VERSION_MAT_VIEW,
};
use crate::wal::sequencer::SeqTxnTracker;
use crate::wal::{segment_dir, EVENT_FILE_NAME, EVENT_INDEX_FILE_NAME};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Framed event log plus its parallel offset index.
pub struct WalEventWriter {
    ff: FilesFacade,
    event: File,
    index: File,
    /// Next body byte; the slot at `append_offset - 4` is the trailing
    /// `-1` placeholder.
    append_offset: u64,
    index_offset: u64,
    txn: i64,
    commit_mode: CommitMode,
    format_version: i32,
    last_start: u64,
    can_rollback: bool,
}

impl WalEventWriter {
    /// Create (or reset) the event pair for a segment: 12-byte header, the
    /// first record's `-1` length placeholder, and the initial index entry
    /// pointing at it.
    pub fn open(ff: FilesFacade, dir: &Path, commit_mode: CommitMode) -> Result<Self> {
        let mut event = ff.open_truncated(&dir.join(EVENT_FILE_NAME))?;
        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&(-1i32).to_le_bytes()); // max txn
        header.extend_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // reserved
        header.extend_from_slice(&(-1i32).to_le_bytes()); // first record placeholder
        ff.write_at(&mut event, 0, &header)?;

        let mut index = ff.open_truncated(&dir.join(EVENT_INDEX_FILE_NAME))?;
        ff.write_at(&mut index, 0, &(WALE_HEADER_SIZE as i64).to_le_bytes())?;

        Ok(Self {
            ff,
            event,
            index,
            append_offset: WALE_HEADER_SIZE + 4,
            index_offset: 8,
            txn: 0,
            commit_mode,
            format_version: WAL_FORMAT_VERSION,
            last_start: WALE_HEADER_SIZE,
            can_rollback: false,
        })
    }

    /// Next txn this writer will assign.
    pub fn txn(&self) -> i64 {
        self.txn
    }

    /// Records committed so far.
    pub fn record_count(&self) -> i64 {
        self.txn
    }

    pub fn append(&mut self, event: &WalEvent) -> Result<i64> {
        let start = self.append_offset - 4;
        let txn = self.txn;

        let mut body = Vec::with_capacity(64);
        put_i64(&mut body, txn);
        body.push(event.txn_type() as u8);
        event.encode_payload(&mut body);
        self.ff.write_at(&mut self.event, self.append_offset, &body)?;
        let end = self.append_offset + body.len() as u64;

        // Trailing placeholder, then the index entry pointing at it.
        self.ff.write_at(&mut self.event, end, &(-1i32).to_le_bytes())?;
        self.ff
            .write_at(&mut self.index, self.index_offset, &(end as i64).to_le_bytes())?;
        if matches!(
            event.txn_type(),
            WalTxnType::MatViewData | WalTxnType::MatViewInvalidate
        ) && self.format_version < WAL_FORMAT_VERSION_MAT_VIEW
        {
            self.format_version = WAL_FORMAT_VERSION_MAT_VIEW;
            self.ff.write_at(
                &mut self.event,
                WAL_FORMAT_OFFSET_32,
                &WAL_FORMAT_VERSION_MAT_VIEW.to_le_bytes(),
            )?;
        }
        if self.commit_mode == CommitMode::Sync {
            self.ff.fdatasync(&self.event)?;
            self.ff.fdatasync(&self.index)?;
        }

        // Commit point: the length patch, then the max-txn marker.
        let record_len = (end - start) as i32;
        self.ff
            .write_at(&mut self.event, start, &record_len.to_le_bytes())?;
        self.ff.write_at(
            &mut self.event,
            WALE_MAX_TXN_OFFSET_32,
            &(txn as i32).to_le_bytes(),
        )?;
        self.sync()?;

        self.append_offset = end + 4;
        self.index_offset += 8;
        self.last_start = start;
        self.can_rollback = true;
        self.txn += 1;
        Ok(txn)
    }

    /// Invalidate the last appended record and rewind the max-txn marker.
    /// The file is not truncated: a concurrent apply job may still be
    /// mmap-reading it. The next append overwrites in place.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.can_rollback {
            return Ok(());
        }
        self.ff
            .write_at(&mut self.event, self.last_start, &(-1i32).to_le_bytes())?;
        self.txn -= 1;
        self.ff.write_at(
            &mut self.event,
            WALE_MAX_TXN_OFFSET_32,
            &((self.txn - 1) as i32).to_le_bytes(),
        )?;
        self.append_offset = self.last_start + 4;
        self.index_offset -= 8;
        self.can_rollback = false;
        self.sync()
    }

    /// Honor the configured commit mode. `Async` leaves the event data flush
    /// to the OS but makes the offset index durable; `Sync` flushes both.
    pub fn sync(&self) -> Result<()> {
        match self.commit_mode {
            CommitMode::NoSync => Ok(()),
            CommitMode::Async => self.ff.fdatasync(&self.index),
            CommitMode::Sync => {
                self.ff.fdatasync(&self.event)?;
                self.ff.fdatasync(&self.index)
            }
        }
    }
}

/// WAL-backed table writer owning one segment.
///
/// Rows buffer in memory; `commit` appends them to the segment column files,
/// emits a DATA event carrying the symbol-dictionary diff, and advances the
/// sequencer.
pub struct WalWriter {
    ff: FilesFacade,
    token: TableToken,
    meta: TableMeta,
    segment: PathBuf,
    wal_id: u32,
    segment_id: u32,
    commit_mode: CommitMode,
    events: WalEventWriter,
    tracker: Arc<SeqTxnTracker>,
    buffer: Vec<Row>,
    symbols: Vec<Option<SymbolDict>>,
    /// Dictionary sizes at the last commit; diff entries start here.
    committed_counts: Vec<i32>,
    segment_row_count: u64,
}

impl WalWriter {
    pub fn open(
        ff: FilesFacade,
        commit_mode: CommitMode,
        token: TableToken,
        table_dir: &Path,
        wal_id: u32,
        segment_id: u32,
        tracker: Arc<SeqTxnTracker>,
    ) -> Result<Self> {
        let meta = TableMeta::read(&ff, table_dir)?;
        let segment = segment_dir(table_dir, wal_id, segment_id);
        ff.mkdirs(&segment)?;
        let events = WalEventWriter::open(ff, &segment, commit_mode)?;
        let symbols: Vec<Option<SymbolDict>> = meta
            .columns
            .iter()
            .map(|c| (c.col_type == ColumnType::Symbol).then(SymbolDict::new))
            .collect();
        let committed_counts = vec![0; meta.columns.len()];
        Ok(Self {
            ff,
            token,
            meta,
            segment,
            wal_id,
            segment_id,
            commit_mode,
            events,
            tracker,
            buffer: Vec::new(),
            symbols,
            committed_counts,
            segment_row_count: 0,
        })
    }

    pub fn token(&self) -> &TableToken {
        &self.token
    }

    pub fn wal_id(&self) -> u32 {
        self.wal_id
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn segment_dir(&self) -> &Path {
        &self.segment
    }

    pub fn append_row(&mut self, row: Row) -> Result<()> {
        if self.tracker.is_suspended() {
            return Err(EngineError::TableSuspended(
                self.token.table_name().to_string(),
            ));
        }
        if row.len() != self.meta.columns.len() {
            return Err(EngineError::Serde(format!(
                "row has {} values, table {} has {} columns",
                row.len(),
                self.token.table_name(),
                self.meta.columns.len()
            )));
        }
        self.buffer.push(row);
        Ok(())
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

    fn flush_rows_to_segment(&mut self) -> Result<(DataEvent, Vec<Row>)> {
        let rows = std::mem::take(&mut self.buffer);
        let mut min_ts = i64::MAX;
        let mut max_ts = i64::MIN;
        let mut out_of_order = false;
        let mut prev_ts = i64::MIN;
        let mut nulls_seen = vec![false; self.meta.columns.len()];

        let mut buffers: Vec<Vec<u8>> = vec![Vec::new(); self.meta.columns.len()];
        for row in &rows {
            let ts = self.row_timestamp(row);
            if ts != NULL_LONG {
                min_ts = min_ts.min(ts);
                max_ts = max_ts.max(ts);
                if ts < prev_ts {
                    out_of_order = true;
                }
                prev_ts = ts;
            }
            for (ci, value) in row.iter().enumerate() {
                let col_type = self.meta.columns[ci].col_type;
                let key = match (col_type, value) {
                    (ColumnType::Symbol, Value::Symbol(s)) => {
                        self.symbols[ci].as_mut().expect("symbol dict").intern(s)
                    }
                    (ColumnType::Symbol, _) => {
                        nulls_seen[ci] = true;
                        NULL_SYMBOL_KEY
                    }
                    _ => 0,
                };
                encode_cell(&mut buffers[ci], col_type, value, key)?;
            }
        }

        let sync = self.commit_mode == CommitMode::Sync;
        for (ci, bytes) in buffers.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let path = self.segment.join(format!("{}.d", self.meta.columns[ci].name));
            let mut file = self.ff.open_rw(&path)?;
            let len = file
                .metadata()
                .map_err(|e| EngineError::io("stat segment column", e))?
                .len();
            self.ff.write_at(&mut file, len, bytes)?;
            if sync {
                self.ff.fdatasync(&file)?;
            }
        }

        // Dictionary deltas for symbol columns touched this txn.
        let mut symbol_diffs = Vec::new();
        for (ci, dict) in self.symbols.iter().enumerate() {
            let Some(dict) = dict else { continue };
            let initial_count = self.committed_counts[ci];
            if dict.len() == initial_count && !nulls_seen[ci] {
                continue;
            }
            let entries = dict.entries()[initial_count as usize..]
                .iter()
                .enumerate()
                .map(|(i, symbol)| SymbolMapDiffEntry {
                    key: initial_count + i as i32,
                    symbol: symbol.clone(),
                })
                .collect();
            symbol_diffs.push(SymbolMapDiff {
                column_index: ci as i32,
                has_null: nulls_seen[ci],
                initial_count,
                count: dict.len(),
                entries,
            });
        }

        let start_row_id = self.segment_row_count as i64;
        let end_row_id = start_row_id + rows.len() as i64;
        Ok((
            DataEvent {
                start_row_id,
                end_row_id,
                min_timestamp: if min_ts == i64::MAX { NULL_LONG } else { min_ts },
                max_timestamp: if max_ts == i64::MIN { NULL_LONG } else { max_ts },
                out_of_order,
                symbol_diffs,
            },
            rows,
        ))
    }

    fn finish_commit(&mut self, row_count: usize) -> i64 {
        self.segment_row_count += row_count as u64;
        for (ci, dict) in self.symbols.iter().enumerate() {
            if let Some(dict) = dict {
                self.committed_counts[ci] = dict.len();
            }
        }
        self.tracker.next_seq_txn()
    }

    /// Commit buffered rows as one DATA transaction. Returns the sequencer
    /// txn, or `None` when nothing was buffered.
    pub fn commit(&mut self) -> Result<Option<i64>> {
        if self.tracker.is_suspended() {
            return Err(EngineError::TableSuspended(
                self.token.table_name().to_string(),
            ));
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let (data, rows) = self.flush_rows_to_segment()?;
        self.events.append(&WalEvent::Data(data))?;
        Ok(Some(self.finish_commit(rows.len())))
    }

    /// Commit buffered rows as a MAT_VIEW_DATA transaction carrying refresh
    /// progress of the view.
    pub fn commit_mat_view_data(
        &mut self,
        last_refresh_base_txn: i64,
        last_refresh_timestamp: i64,
    ) -> Result<Option<i64>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let (data, rows) = self.flush_rows_to_segment()?;
        self.events.append(&WalEvent::MatViewData {
            data,
            last_refresh_base_txn,
            last_refresh_timestamp,
        })?;
        Ok(Some(self.finish_commit(rows.len())))
    }

    /// Record a structural SQL statement (ALTER and friends) for replay.
    pub fn commit_sql(&mut self, sql: SqlEvent) -> Result<i64> {
        self.events.append(&WalEvent::Sql(sql))?;
        Ok(self.tracker.next_seq_txn())
    }

    pub fn commit_truncate(&mut self) -> Result<i64> {
        self.buffer.clear();
        self.events.append(&WalEvent::Truncate)?;
        Ok(self.tracker.next_seq_txn())
    }

    pub fn commit_mat_view_invalidate(
        &mut self,
        invalid: bool,
        reason: Option<String>,
    ) -> Result<i64> {
        self.events.append(&WalEvent::MatViewInvalidate { invalid, reason })?;
        Ok(self.tracker.next_seq_txn())
    }

    /// Drop buffered rows that have not reached the segment.
    pub fn rollback(&mut self) {
        self.buffer.clear();
    }

    pub fn events(&self) -> &WalEventWriter {
        &self.events
    }

    #[cfg(test)]
    pub(crate) fn events_mut(&mut self) -> &mut WalEventWriter {
        &mut self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionBy;
    use crate::table::meta::ColumnMeta;
    use crate::table::writer::TableWriter;
    use tempfile::TempDir;

    fn wal_table(tmp: &TempDir) -> (PathBuf, TableToken, Arc<SeqTxnTracker>) {
        let dir = tmp.path().join("t");
        let ff = FilesFacade::new();
        let meta = TableMeta::new(
            3,
            true,
            PartitionBy::Day,
            vec![
                ColumnMeta::new("sym", ColumnType::Symbol),
                ColumnMeta::new("price", ColumnType::Double),
                ColumnMeta::new("ts", ColumnType::Timestamp),
            ],
        );
        TableWriter::create(&ff, &dir, &meta).unwrap();
        let token = TableToken::new("t", "t", 3, true, false);
        (dir, token, Arc::new(SeqTxnTracker::new()))
    }

    fn read_index(path: &Path) -> Vec<i64> {
        let bytes = std::fs::read(path).unwrap();
        bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_index_has_n_plus_one_entries() {
        let tmp = TempDir::new().unwrap();
        let (dir, token, tracker) = wal_table(&tmp);
        let mut writer = WalWriter::open(
            FilesFacade::new(),
            CommitMode::Sync,
            token,
            &dir,
            1,
            0,
            tracker,
        )
        .unwrap();

        let day0 = 1_704_067_200_000_000;
        for i in 0..3 {
            writer
                .append_row(vec![
                    Value::Symbol("A".into()),
                    Value::Double(i as f64),
                    Value::Timestamp(day0 + i),
                ])
                .unwrap();
            writer.commit().unwrap();
        }

        let index = read_index(&writer.segment_dir().join(EVENT_INDEX_FILE_NAME));
        assert_eq!(index.len(), 4);
        assert_eq!(index[0], WALE_HEADER_SIZE as i64);

        // The last entry points at the terminal -1 placeholder.
        let event = std::fs::read(writer.segment_dir().join(EVENT_FILE_NAME)).unwrap();
        let last = index[3] as usize;
        assert_eq!(
            i32::from_le_bytes(event[last..last + 4].try_into().unwrap()),
            -1
        );
        // Header carries the highest committed txn.
        assert_eq!(i32::from_le_bytes(event[0..4].try_into().unwrap()), 2);
    }

    #[test]
    fn test_symbol_diff_carries_only_new_symbols() {
        let tmp = TempDir::new().unwrap();
        let (dir, token, tracker) = wal_table(&tmp);
        let mut writer = WalWriter::open(
            FilesFacade::new(),
            CommitMode::NoSync,
            token,
            &dir,
            1,
            0,
            tracker,
        )
        .unwrap();

        let day0 = 1_704_067_200_000_000;
        writer
            .append_row(vec![
                Value::Symbol("A".into()),
                Value::Double(1.0),
                Value::Timestamp(day0),
            ])
            .unwrap();
        writer.commit().unwrap();

        // Second txn reuses "A", adds "B": diff must carry only "B".
        writer
            .append_row(vec![
                Value::Symbol("A".into()),
                Value::Double(2.0),
                Value::Timestamp(day0 + 1),
            ])
            .unwrap();
        writer
            .append_row(vec![
                Value::Symbol("B".into()),
                Value::Double(3.0),
                Value::Timestamp(day0 + 2),
            ])
            .unwrap();
        writer.commit().unwrap();

        let mut cursor =
            crate::wal::reader::WalEventCursor::open(&FilesFacade::new(), writer.segment_dir())
                .unwrap();
        let first = cursor.next().unwrap().unwrap();
        let second = cursor.next().unwrap().unwrap();
        assert!(cursor.next().unwrap().is_none());

        match (&first.event, &second.event) {
            (WalEvent::Data(d1), WalEvent::Data(d2)) => {
                assert_eq!(d1.symbol_diffs[0].initial_count, 0);
                assert_eq!(d1.symbol_diffs[0].entries.len(), 1);
                assert_eq!(d2.symbol_diffs[0].initial_count, 1);
                assert_eq!(d2.symbol_diffs[0].entries.len(), 1);
                assert_eq!(d2.symbol_diffs[0].entries[0].symbol, "B");
                assert_eq!(d2.start_row_id, 1);
                assert_eq!(d2.end_row_id, 3);
            }
            other => panic!("expected data events, got {other:?}"),
        }
    }

    #[test]
    fn test_rollback_invalidates_last_record() {
        let tmp = TempDir::new().unwrap();
        let (dir, token, tracker) = wal_table(&tmp);
        let mut writer = WalWriter::open(
            FilesFacade::new(),
            CommitMode::Sync,
            token,
            &dir,
            1,
            0,
            tracker,
        )
        .unwrap();

        let day0 = 1_704_067_200_000_000;
        for i in 0..2 {
            writer
                .append_row(vec![
                    Value::Symbol("A".into()),
                    Value::Double(1.0),
                    Value::Timestamp(day0 + i),
                ])
                .unwrap();
            writer.commit().unwrap();
        }

        let len_before = std::fs::metadata(writer.segment_dir().join(EVENT_FILE_NAME))
            .unwrap()
            .len();
        writer.events_mut().rollback().unwrap();
        // Not truncated: an apply job may still be reading the file.
        let len_after = std::fs::metadata(writer.segment_dir().join(EVENT_FILE_NAME))
            .unwrap()
            .len();
        assert_eq!(len_before, len_after);

        // Replay sees only the first record.
        let mut cursor =
            crate::wal::reader::WalEventCursor::open(&FilesFacade::new(), writer.segment_dir())
                .unwrap();
        assert!(cursor.next().unwrap().is_some());
        assert!(cursor.next().unwrap().is_none());

        // The next append overwrites in place.
        writer.events_mut().append(&WalEvent::Truncate).unwrap();
        let mut cursor =
            crate::wal::reader::WalEventCursor::open(&FilesFacade::new(), writer.segment_dir())
                .unwrap();
        cursor.next().unwrap().unwrap();
        let replacement = cursor.next().unwrap().unwrap();
        assert_eq!(replacement.event, WalEvent::Truncate);
        assert_eq!(replacement.txn, 1);
    }

    #[test]
    fn test_suspended_table_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let (dir, token, tracker) = wal_table(&tmp);
        let mut writer = WalWriter::open(
            FilesFacade::new(),
            CommitMode::NoSync,
            token,
            &dir,
            1,
            0,
            tracker.clone(),
        )
        .unwrap();

        tracker.suspend();
        let err = writer
            .append_row(vec![
                Value::Symbol("A".into()),
                Value::Double(1.0),
                Value::Timestamp(0),
            ])
            .unwrap_err();
        assert!(matches!(err, EngineError::TableSuspended(_)));
    }
}
