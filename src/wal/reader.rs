//! WAL event replay cursor

use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::wal::events::{ByteReader, WalEvent, WalTxnType, WALE_HEADER_SIZE};
use crate::wal::EVENT_FILE_NAME;
use memmap2::Mmap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct WalEventRecord {
    pub txn: i64,
    pub event: WalEvent,
}

/// Sequential decoder over a segment's event file.
///
/// Iteration stops at the first record whose length slot still holds `-1`
/// (uncommitted or rolled back) and tolerates a short tail from a crashed
/// writer; committed records with undecodable bodies are corruption.
pub struct WalEventCursor {
    path: PathBuf,
    map: Mmap,
    pos: usize,
}

impl WalEventCursor {
    pub fn open(ff: &FilesFacade, segment_dir: &Path) -> Result<Self> {
        let path = segment_dir.join(EVENT_FILE_NAME);
        let file = ff.open_ro(&path)?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::io("stat _event", e))?
            .len() as usize;
        if len < WALE_HEADER_SIZE as usize {
            return Err(EngineError::Corrupt {
                path,
                detail: format!("event file shorter than header: {len}"),
            });
        }
        let map = ff.mmap_ro(&file, len)?;
        Ok(Self {
            path,
            map,
            pos: WALE_HEADER_SIZE as usize,
        })
    }

    /// Highest committed txn recorded in the header, -1 for an empty segment.
    pub fn max_txn(&self) -> i32 {
        i32::from_le_bytes(self.map[0..4].try_into().unwrap())
    }

    pub fn next(&mut self) -> Result<Option<WalEventRecord>> {
        if self.pos + 4 > self.map.len() {
            return Ok(None); // short tail
        }
        let record_len =
            i32::from_le_bytes(self.map[self.pos..self.pos + 4].try_into().unwrap());
        if record_len <= 0 {
            return Ok(None); // uncommitted or rolled back
        }
        let end = self.pos + record_len as usize;
        if end > self.map.len() {
            return Ok(None); // committed length but body never landed
        }

        let body = &self.map[self.pos + 4..end];
        let mut reader = ByteReader::new(&self.path, body);
        let txn = reader.read_i64()?;
        let txn_type = WalTxnType::from_u8(&self.path, reader.read_u8()?)?;
        let event = WalEvent::decode_payload(txn_type, &mut reader)?;
        if reader.remaining() != 0 {
            return Err(EngineError::Corrupt {
                path: self.path.clone(),
                detail: format!(
                    "record txn={txn} has {} undecoded bytes",
                    reader.remaining()
                ),
            });
        }

        self.pos = end;
        Ok(Some(WalEventRecord { txn, event }))
    }

    /// Drain all committed records.
    pub fn read_all(&mut self) -> Result<Vec<WalEventRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next()? {
            records.push(record);
        }
        Ok(records)
    }
}
