//! Column-version index (`_cv`)
//!
//! Double-buffered on-disk index mapping `(partition, column)` to
//! `(column name txn, column top)`. The single writer serializes the whole
//! record vector into the inactive area, fences, and only then publishes the
//! new version; parity of the version selects the active area. Readers run a
//! seqlock loop and never block the writer.
//!
//! Header layout (48 bytes):
//!
//! ```text
//! off 0  : u64 version          (monotonic; parity selects active area)
//! off 8  : u64 offsetA,  u64 sizeA
//! off 24 : u64 offsetB,  u64 sizeB
//! off 40 : reserved
//! ```
//!
//! Each record is 32 bytes: four little-endian i64 fields
//! `(partition_timestamp, column_index, column_name_txn, column_top)`,
//! sorted by `(partition_timestamp ASC, column_index ASC)`.

use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crossbeam::utils::Backoff;
use memmap2::{Mmap, MmapMut};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const HEADER_SIZE: usize = 48;
pub const RECORD_SIZE: usize = 32;

const VERSION_OFFSET: usize = 0;
const OFFSET_A: usize = 8;
const SIZE_A: usize = 16;
const OFFSET_B: usize = 24;
const SIZE_B: usize = 32;

/// Sentinel partition: the record applies to all partitions. Used for the
/// "column added" default entry whose `column_top` field carries the
/// introduction partition timestamp.
pub const COL_TOP_DEFAULT_PARTITION: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CvRecord {
    pub partition_timestamp: i64,
    pub column_index: i64,
    pub column_name_txn: i64,
    pub column_top: i64,
}

fn record_key(r: &CvRecord) -> (i64, i64) {
    (r.partition_timestamp, r.column_index)
}

/// Version word viewed through the shared mapping. The header is page
/// aligned so the u64 at offset 0 is safe to access atomically.
unsafe fn version_cell(base: *const u8) -> &'static AtomicU64 {
    &*(base.add(VERSION_OFFSET) as *const AtomicU64)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

/// Single-owner writer side of the `_cv` file.
pub struct ColumnVersionWriter {
    ff: FilesFacade,
    path: PathBuf,
    file: File,
    map: MmapMut,
    version: u64,
    records: Vec<CvRecord>,
}

impl ColumnVersionWriter {
    pub fn open(ff: FilesFacade, path: &Path) -> Result<Self> {
        let file = ff.open_rw(path)?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::io("stat _cv", e))?
            .len() as usize;
        let map_len = len.max(HEADER_SIZE).next_power_of_two().max(4096);
        let map = ff.mmap_rw(&file, map_len)?;

        let mut writer = Self {
            ff,
            path: path.to_path_buf(),
            file,
            map,
            version: 0,
            records: Vec::new(),
        };
        if len >= HEADER_SIZE {
            writer.version = read_u64(&writer.map, VERSION_OFFSET);
            let (offset, size) = writer.active_area();
            writer.records = decode_records(&writer.path, &writer.map, offset, size)?;
        } else {
            // Fresh file: version 0, both areas empty.
            writer.map[..HEADER_SIZE].fill(0);
            writer
                .map
                .flush()
                .map_err(|e| EngineError::io("flush _cv header", e))?;
        }
        Ok(writer)
    }

    fn active_area(&self) -> (u64, u64) {
        if self.version & 1 == 0 {
            (read_u64(&self.map, OFFSET_A), read_u64(&self.map, SIZE_A))
        } else {
            (read_u64(&self.map, OFFSET_B), read_u64(&self.map, SIZE_B))
        }
    }

    fn inactive_area(&self) -> (u64, u64) {
        if self.version & 1 == 0 {
            (read_u64(&self.map, OFFSET_B), read_u64(&self.map, SIZE_B))
        } else {
            (read_u64(&self.map, OFFSET_A), read_u64(&self.map, SIZE_A))
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn records(&self) -> &[CvRecord] {
        &self.records
    }

    /// Insert or update the record for `(partition_timestamp, column_index)`.
    /// In-memory only until [`commit`](Self::commit).
    pub fn upsert(
        &mut self,
        partition_timestamp: i64,
        column_index: i64,
        column_name_txn: i64,
        column_top: i64,
    ) {
        let record = CvRecord {
            partition_timestamp,
            column_index,
            column_name_txn,
            column_top,
        };
        match self
            .records
            .binary_search_by_key(&record_key(&record), record_key)
        {
            Ok(pos) => self.records[pos] = record,
            Err(pos) => self.records.insert(pos, record),
        }
    }

    /// Record that `column_index` first appears in `introduction_partition`.
    /// Partitions at or after it default to a column top of 0; earlier
    /// partitions report the column as absent.
    pub fn register_column(
        &mut self,
        column_index: i64,
        column_name_txn: i64,
        introduction_partition: i64,
    ) {
        self.upsert(
            COL_TOP_DEFAULT_PARTITION,
            column_index,
            column_name_txn,
            introduction_partition,
        );
    }

    pub fn remove_partition(&mut self, partition_timestamp: i64) {
        self.records
            .retain(|r| r.partition_timestamp != partition_timestamp);
    }

    /// Column top for a partition as the writer sees it (uncommitted state).
    pub fn column_top(&self, partition_timestamp: i64, column_index: i64) -> i64 {
        lookup_column_top(&self.records, partition_timestamp, column_index)
    }

    /// Serialize the record vector into the inactive area, fence, then flip
    /// the version. The version strictly increases by 1 per commit.
    pub fn commit(&mut self) -> Result<()> {
        let payload = encode_records(&self.records);
        let size = payload.len() as u64;

        // Reuse the inactive area's previous region when the snapshot fits,
        // otherwise place it after everything currently referenced.
        let (prev_offset, prev_size) = self.inactive_area();
        let offset = if prev_offset >= HEADER_SIZE as u64 && size <= prev_size {
            prev_offset
        } else {
            let (a_off, a_size) = (read_u64(&self.map, OFFSET_A), read_u64(&self.map, SIZE_A));
            let (b_off, b_size) = (read_u64(&self.map, OFFSET_B), read_u64(&self.map, SIZE_B));
            (HEADER_SIZE as u64)
                .max(a_off + a_size)
                .max(b_off + b_size)
        };

        let end = (offset + size) as usize;
        if end > self.map.len() {
            let new_len = end.next_power_of_two();
            self.map = self.ff.mmap_rw(&self.file, new_len)?;
        }

        self.map[offset as usize..end].copy_from_slice(&payload);
        let (off_slot, size_slot) = if (self.version + 1) & 1 == 0 {
            (OFFSET_A, SIZE_A)
        } else {
            (OFFSET_B, SIZE_B)
        };
        self.map[off_slot..off_slot + 8].copy_from_slice(&offset.to_le_bytes());
        self.map[size_slot..size_slot + 8].copy_from_slice(&size.to_le_bytes());
        if size > 0 {
            self.map
                .flush_range(offset as usize, size as usize)
                .map_err(|e| EngineError::io("flush _cv area", e))?;
        }

        // Publish: data and offsets must be visible before the new version.
        fence(Ordering::Release);
        self.version += 1;
        unsafe { version_cell(self.map.as_ptr()) }.store(self.version, Ordering::Release);
        self.map
            .flush_range(0, HEADER_SIZE)
            .map_err(|e| EngineError::io("flush _cv header", e))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn poke_header(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        let _ = self.map.flush_range(0, HEADER_SIZE);
    }
}

/// Read side of the `_cv` file. Any number of readers may coexist with the
/// single writer; reads are bounded by the configured spin-lock timeout.
pub struct ColumnVersionReader {
    ff: FilesFacade,
    path: PathBuf,
    file: File,
    map: Mmap,
    spin_lock_timeout: Duration,
}

impl ColumnVersionReader {
    pub fn open(ff: FilesFacade, path: &Path, spin_lock_timeout: Duration) -> Result<Self> {
        let file = ff.open_ro(path)?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::io("stat _cv", e))?
            .len() as usize;
        if len < HEADER_SIZE {
            return Err(EngineError::Corrupt {
                path: path.to_path_buf(),
                detail: format!("column version file shorter than header: {len}"),
            });
        }
        let map = ff.mmap_ro(&file, len)?;
        Ok(Self {
            ff,
            path: path.to_path_buf(),
            file,
            map,
            spin_lock_timeout,
        })
    }

    fn remap(&mut self) -> Result<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| EngineError::io("stat _cv", e))?
            .len() as usize;
        if len > self.map.len() {
            self.map = self.ff.mmap_ro(&self.file, len)?;
        }
        Ok(())
    }

    /// Seqlock read: returns a consistent snapshot at exactly one committed
    /// version, or a CRITICAL error when the writer keeps racing past the
    /// spin-lock timeout.
    pub fn read_safe(&mut self) -> Result<ColumnVersionSnapshot> {
        let deadline = Instant::now() + self.spin_lock_timeout;
        let backoff = Backoff::new();
        loop {
            let version_cell = unsafe { version_cell(self.map.as_ptr()) };
            let v1 = version_cell.load(Ordering::Acquire);
            let parity = v1 & 1;
            let (offset, size) = if parity == 0 {
                (read_u64(&self.map, OFFSET_A), read_u64(&self.map, SIZE_A))
            } else {
                (read_u64(&self.map, OFFSET_B), read_u64(&self.map, SIZE_B))
            };

            fence(Ordering::Acquire);
            let v2 = version_cell.load(Ordering::Acquire);
            if v2 != v1 || (offset as usize) + (size as usize) > self.map.len() {
                // Writer mid-update, or the area lives past our mapping.
                self.remap()?;
                if Instant::now() >= deadline {
                    return Err(EngineError::critical(format!(
                        "Column Version read timeout [path={},version={v1}]",
                        self.path.display()
                    )));
                }
                backoff.spin();
                continue;
            }

            let records = decode_records(&self.path, &self.map, offset, size)?;

            fence(Ordering::Acquire);
            let v3 = version_cell.load(Ordering::Acquire);
            if v3 != v1 {
                if Instant::now() >= deadline {
                    return Err(EngineError::critical(format!(
                        "Column Version read timeout [path={},version={v1}]",
                        self.path.display()
                    )));
                }
                backoff.spin();
                continue;
            }

            return Ok(ColumnVersionSnapshot {
                version: v1,
                records,
            });
        }
    }
}

/// Immutable snapshot of the index at one committed version.
#[derive(Debug, Clone)]
pub struct ColumnVersionSnapshot {
    pub version: u64,
    records: Vec<CvRecord>,
}

impl ColumnVersionSnapshot {
    pub fn records(&self) -> &[CvRecord] {
        &self.records
    }

    /// Index of the record for `(partition_timestamp, column_index)`:
    /// binary search locates the partition block, then a short linear scan
    /// finds the column (records within a partition are ordered, so the scan
    /// exits early once it passes `column_index`).
    pub fn get_record_index(&self, partition_timestamp: i64, column_index: i64) -> Option<usize> {
        find_record(&self.records, partition_timestamp, column_index)
    }

    /// Number of leading null rows for the column in the partition; 0 when
    /// the column is fully present, -1 when it does not exist there yet.
    pub fn get_column_top(&self, partition_timestamp: i64, column_index: i64) -> i64 {
        lookup_column_top(&self.records, partition_timestamp, column_index)
    }

    pub fn get_column_name_txn(&self, partition_timestamp: i64, column_index: i64) -> i64 {
        if let Some(i) = self.get_record_index(partition_timestamp, column_index) {
            return self.records[i].column_name_txn;
        }
        if let Some(i) = self.get_record_index(COL_TOP_DEFAULT_PARTITION, column_index) {
            return self.records[i].column_name_txn;
        }
        -1
    }
}

fn encode_records(records: &[CvRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * RECORD_SIZE);
    for r in records {
        out.extend_from_slice(&r.partition_timestamp.to_le_bytes());
        out.extend_from_slice(&r.column_index.to_le_bytes());
        out.extend_from_slice(&r.column_name_txn.to_le_bytes());
        out.extend_from_slice(&r.column_top.to_le_bytes());
    }
    out
}

fn decode_records(path: &Path, bytes: &[u8], offset: u64, size: u64) -> Result<Vec<CvRecord>> {
    if size % RECORD_SIZE as u64 != 0 {
        return Err(EngineError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("column version area size {size} not a multiple of {RECORD_SIZE}"),
        });
    }
    let area = &bytes[offset as usize..(offset + size) as usize];
    let mut records = Vec::with_capacity(area.len() / RECORD_SIZE);
    for chunk in area.chunks_exact(RECORD_SIZE) {
        records.push(CvRecord {
            partition_timestamp: i64::from_le_bytes(chunk[0..8].try_into().unwrap()),
            column_index: i64::from_le_bytes(chunk[8..16].try_into().unwrap()),
            column_name_txn: i64::from_le_bytes(chunk[16..24].try_into().unwrap()),
            column_top: i64::from_le_bytes(chunk[24..32].try_into().unwrap()),
        });
    }
    Ok(records)
}

fn find_record(records: &[CvRecord], partition_timestamp: i64, column_index: i64) -> Option<usize> {
    let block = records.partition_point(|r| r.partition_timestamp < partition_timestamp);
    for (i, r) in records[block..].iter().enumerate() {
        if r.partition_timestamp != partition_timestamp || r.column_index > column_index {
            return None;
        }
        if r.column_index == column_index {
            return Some(block + i);
        }
    }
    None
}

fn lookup_column_top(records: &[CvRecord], partition_timestamp: i64, column_index: i64) -> i64 {
    if let Some(i) = find_record(records, partition_timestamp, column_index) {
        return records[i].column_top;
    }
    // No explicit record: consult the "column added" default entry. Its
    // column_top field holds the introduction partition.
    if let Some(i) = find_record(records, COL_TOP_DEFAULT_PARTITION, column_index) {
        let introduced_at = records[i].column_top;
        return if introduced_at <= partition_timestamp { 0 } else { -1 };
    }
    // Column existed from table creation.
    0
}
