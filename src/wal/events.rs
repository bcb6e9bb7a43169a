//! WAL event records
//!
//! Binary framing of per-transaction events: record kinds, symbol-dictionary
//! diffs and bind-variable serialization. All integers are little-endian;
//! strings are i32 byte-length prefixed UTF-8.

use crate::error::{EngineError, Result};
use std::path::Path;

/// Event file header: `[max_txn: i32][format_version: i32][reserved: i32]`.
pub const WALE_HEADER_SIZE: u64 = 12;
/// Header slot patched with the highest committed txn on every commit.
pub const WALE_MAX_TXN_OFFSET_32: u64 = 0;
/// Header slot bumped to the mat-view format when the first mat-view record
/// appears in the segment.
pub const WAL_FORMAT_OFFSET_32: u64 = 4;

pub const WAL_FORMAT_VERSION: i32 = 1;
pub const WAL_FORMAT_VERSION_MAT_VIEW: i32 = 2;

/// SQL record command kinds.
pub const CMD_ALTER_TABLE: i32 = 1;
pub const CMD_RENAME_TABLE: i32 = 2;
pub const CMD_UPDATE: i32 = 3;

/// Terminates the entry list of one symbol-column diff.
pub const END_OF_SYMBOL_ENTRIES: i32 = -1;
/// Terminates the whole symbol-diff block.
pub const END_OF_SYMBOL_DIFFS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalTxnType {
    Data = 0,
    Sql = 1,
    Truncate = 2,
    MatViewData = 3,
    MatViewInvalidate = 4,
}

impl WalTxnType {
    pub fn from_u8(path: &Path, value: u8) -> Result<Self> {
        Ok(match value {
            0 => WalTxnType::Data,
            1 => WalTxnType::Sql,
            2 => WalTxnType::Truncate,
            3 => WalTxnType::MatViewData,
            4 => WalTxnType::MatViewInvalidate,
            other => {
                return Err(EngineError::Corrupt {
                    path: path.to_path_buf(),
                    detail: format!("unknown wal txn type {other}"),
                })
            }
        })
    }
}

/// One symbol newly interned this transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMapDiffEntry {
    pub key: i32,
    pub symbol: String,
}

/// Dictionary delta for one symbol column. Only symbols with
/// `key >= initial_count` (those added this txn) are carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMapDiff {
    pub column_index: i32,
    pub has_null: bool,
    pub initial_count: i32,
    pub count: i32,
    pub entries: Vec<SymbolMapDiffEntry>,
}

/// Bind variable. Serialization dispatches on a runtime type tag, one
/// encoder per tag.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Timestamp(i64),
    Str(String),
}

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;
const TAG_STR: u8 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub start_row_id: i64,
    pub end_row_id: i64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub out_of_order: bool,
    pub symbol_diffs: Vec<SymbolMapDiff>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlEvent {
    pub cmd_type: i32,
    pub sql: String,
    pub rnd_seed0: i64,
    pub rnd_seed1: i64,
    pub indexed_vars: Vec<BindValue>,
    pub named_vars: Vec<(String, BindValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalEvent {
    Data(DataEvent),
    MatViewData {
        data: DataEvent,
        last_refresh_base_txn: i64,
        last_refresh_timestamp: i64,
    },
    Sql(SqlEvent),
    Truncate,
    MatViewInvalidate {
        invalid: bool,
        reason: Option<String>,
    },
}

impl WalEvent {
    pub fn txn_type(&self) -> WalTxnType {
        match self {
            WalEvent::Data(_) => WalTxnType::Data,
            WalEvent::MatViewData { .. } => WalTxnType::MatViewData,
            WalEvent::Sql(_) => WalTxnType::Sql,
            WalEvent::Truncate => WalTxnType::Truncate,
            WalEvent::MatViewInvalidate { .. } => WalTxnType::MatViewInvalidate,
        }
    }

    /// Encode the type-specific payload (everything after the txn type byte).
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            WalEvent::Data(data) => encode_data(data, out),
            WalEvent::MatViewData {
                data,
                last_refresh_base_txn,
                last_refresh_timestamp,
            } => {
                put_i64(out, *last_refresh_base_txn);
                put_i64(out, *last_refresh_timestamp);
                encode_data(data, out);
            }
            WalEvent::Sql(sql) => {
                put_i32(out, sql.cmd_type);
                put_str(out, &sql.sql);
                put_i64(out, sql.rnd_seed0);
                put_i64(out, sql.rnd_seed1);
                put_i32(out, sql.indexed_vars.len() as i32);
                for var in &sql.indexed_vars {
                    encode_bind_value(var, out);
                }
                put_i32(out, sql.named_vars.len() as i32);
                for (name, var) in &sql.named_vars {
                    put_str(out, name);
                    encode_bind_value(var, out);
                }
            }
            WalEvent::Truncate => {}
            WalEvent::MatViewInvalidate { invalid, reason } => {
                out.push(u8::from(*invalid));
                match reason {
                    Some(reason) => put_str(out, reason),
                    None => put_i32(out, -1),
                }
            }
        }
    }

    pub fn decode_payload(txn_type: WalTxnType, reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match txn_type {
            WalTxnType::Data => WalEvent::Data(decode_data(reader)?),
            WalTxnType::MatViewData => {
                let last_refresh_base_txn = reader.read_i64()?;
                let last_refresh_timestamp = reader.read_i64()?;
                WalEvent::MatViewData {
                    data: decode_data(reader)?,
                    last_refresh_base_txn,
                    last_refresh_timestamp,
                }
            }
            WalTxnType::Sql => {
                let cmd_type = reader.read_i32()?;
                let sql = reader.read_str()?;
                let rnd_seed0 = reader.read_i64()?;
                let rnd_seed1 = reader.read_i64()?;
                let indexed_count = reader.read_i32()?;
                let mut indexed_vars = Vec::with_capacity(indexed_count.max(0) as usize);
                for _ in 0..indexed_count {
                    indexed_vars.push(decode_bind_value(reader)?);
                }
                let named_count = reader.read_i32()?;
                let mut named_vars = Vec::with_capacity(named_count.max(0) as usize);
                for _ in 0..named_count {
                    let name = reader.read_str()?;
                    named_vars.push((name, decode_bind_value(reader)?));
                }
                WalEvent::Sql(SqlEvent {
                    cmd_type,
                    sql,
                    rnd_seed0,
                    rnd_seed1,
                    indexed_vars,
                    named_vars,
                })
            }
            WalTxnType::Truncate => WalEvent::Truncate,
            WalTxnType::MatViewInvalidate => {
                let invalid = reader.read_u8()? != 0;
                let reason = reader.read_opt_str()?;
                WalEvent::MatViewInvalidate { invalid, reason }
            }
        })
    }
}

fn encode_data(data: &DataEvent, out: &mut Vec<u8>) {
    put_i64(out, data.start_row_id);
    put_i64(out, data.end_row_id);
    put_i64(out, data.min_timestamp);
    put_i64(out, data.max_timestamp);
    out.push(u8::from(data.out_of_order));
    for diff in &data.symbol_diffs {
        put_i32(out, diff.column_index);
        out.push(u8::from(diff.has_null));
        put_i32(out, diff.initial_count);
        put_i32(out, diff.count);
        for entry in &diff.entries {
            debug_assert!(entry.key >= diff.initial_count);
            put_i32(out, entry.key);
            put_str(out, &entry.symbol);
        }
        put_i32(out, END_OF_SYMBOL_ENTRIES);
    }
    put_i32(out, END_OF_SYMBOL_DIFFS);
}

fn decode_data(reader: &mut ByteReader<'_>) -> Result<DataEvent> {
    let start_row_id = reader.read_i64()?;
    let end_row_id = reader.read_i64()?;
    let min_timestamp = reader.read_i64()?;
    let max_timestamp = reader.read_i64()?;
    let out_of_order = reader.read_u8()? != 0;

    let mut symbol_diffs = Vec::new();
    loop {
        let column_index = reader.read_i32()?;
        if column_index == END_OF_SYMBOL_DIFFS {
            break;
        }
        let has_null = reader.read_u8()? != 0;
        let initial_count = reader.read_i32()?;
        let count = reader.read_i32()?;
        let mut entries = Vec::new();
        loop {
            let key = reader.read_i32()?;
            if key == END_OF_SYMBOL_ENTRIES {
                break;
            }
            entries.push(SymbolMapDiffEntry {
                key,
                symbol: reader.read_str()?,
            });
        }
        symbol_diffs.push(SymbolMapDiff {
            column_index,
            has_null,
            initial_count,
            count,
            entries,
        });
    }

    Ok(DataEvent {
        start_row_id,
        end_row_id,
        min_timestamp,
        max_timestamp,
        out_of_order,
        symbol_diffs,
    })
}

fn encode_bind_value(value: &BindValue, out: &mut Vec<u8>) {
    match value {
        BindValue::Null => out.push(TAG_NULL),
        BindValue::Boolean(v) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*v));
        }
        BindValue::Int(v) => {
            out.push(TAG_INT);
            put_i32(out, *v);
        }
        BindValue::Long(v) => {
            out.push(TAG_LONG);
            put_i64(out, *v);
        }
        BindValue::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        BindValue::Timestamp(v) => {
            out.push(TAG_TIMESTAMP);
            put_i64(out, *v);
        }
        BindValue::Str(v) => {
            out.push(TAG_STR);
            put_str(out, v);
        }
    }
}

fn decode_bind_value(reader: &mut ByteReader<'_>) -> Result<BindValue> {
    Ok(match reader.read_u8()? {
        TAG_NULL => BindValue::Null,
        TAG_BOOLEAN => BindValue::Boolean(reader.read_u8()? != 0),
        TAG_INT => BindValue::Int(reader.read_i32()?),
        TAG_LONG => BindValue::Long(reader.read_i64()?),
        TAG_DOUBLE => BindValue::Double(f64::from_le_bytes(reader.read_array()?)),
        TAG_TIMESTAMP => BindValue::Timestamp(reader.read_i64()?),
        TAG_STR => BindValue::Str(reader.read_str()?),
        other => {
            return Err(reader.corrupt(format!("unknown bind variable tag {other}")));
        }
    })
}

pub fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_str(out: &mut Vec<u8>, value: &str) {
    put_i32(out, value.len() as i32);
    out.extend_from_slice(value.as_bytes());
}

/// Bounds-checked little-endian reader over a decoded record body.
pub struct ByteReader<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(path: &'a Path, bytes: &'a [u8]) -> Self {
        Self { path, bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn corrupt(&self, detail: String) -> EngineError {
        EngineError::Corrupt {
            path: self.path.to_path_buf(),
            detail,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.corrupt(format!(
                "short read at {}: wanted {n}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(self.corrupt(format!("negative string length {len}")));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| self.corrupt(format!("invalid utf-8 string: {e}")))
    }

    /// A string slot where length -1 means absent.
    pub fn read_opt_str(&mut self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        Ok(Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
            self.corrupt(format!("invalid utf-8 string: {e}"))
        })?))
    }
}
