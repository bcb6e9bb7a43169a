//! Checkpoint barrier
//!
//! While a checkpoint is in progress no new reader locks may be taken, so
//! the set of table files a snapshot copies is stable. The manifest is
//! persisted before the flag is honored; a manifest found at startup means a
//! half-completed checkpoint that recovery discards.

use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::table::token::TableToken;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Reason surfaced by `lock_readers*` while the barrier is up.
pub const REASON_CHECKPOINT_IN_PROGRESS: &str = "checkpointInProgress";

const MANIFEST_FILE_NAME: &str = "_checkpoint.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub tables: Vec<CheckpointTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTable {
    pub table_name: String,
    pub dir_name: String,
    pub table_id: i32,
}

pub struct CheckpointAgent {
    ff: FilesFacade,
    manifest_path: PathBuf,
    in_progress: AtomicBool,
}

impl CheckpointAgent {
    pub fn new(ff: FilesFacade, db_root: &Path) -> Self {
        Self {
            ff,
            manifest_path: db_root.join(MANIFEST_FILE_NAME),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Raise the barrier. The manifest lands on disk before the flag flips,
    /// so a crash mid-checkpoint is detectable at the next startup.
    pub fn checkpoint_create(&self, tables: &[TableToken]) -> Result<()> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::CheckpointInProgress);
        }
        let manifest = CheckpointManifest {
            tables: tables
                .iter()
                .map(|t| CheckpointTable {
                    table_name: t.table_name().to_string(),
                    dir_name: t.dir_name().to_string(),
                    table_id: t.table_id(),
                })
                .collect(),
        };
        let result = serde_json::to_vec_pretty(&manifest)
            .map_err(EngineError::from)
            .and_then(|bytes| self.ff.write_atomic(&self.manifest_path, &bytes));
        if let Err(err) = result {
            self.in_progress.store(false, Ordering::Release);
            return Err(err);
        }
        log::info!("checkpoint started [tables={}]", manifest.tables.len());
        Ok(())
    }

    /// Lower the barrier and discard the manifest.
    pub fn checkpoint_release(&self) -> Result<()> {
        if self.ff.exists(&self.manifest_path) {
            self.ff.unlink(&self.manifest_path)?;
        }
        self.in_progress.store(false, Ordering::Release);
        log::info!("checkpoint released");
        Ok(())
    }

    /// Startup reconciliation: a manifest on disk means the process died
    /// between create and release. The snapshot is incomplete and dropped.
    pub fn checkpoint_recover(&self) -> Result<Option<CheckpointManifest>> {
        if !self.ff.exists(&self.manifest_path) {
            return Ok(None);
        }
        let bytes = self.ff.read(&self.manifest_path)?;
        let manifest: CheckpointManifest = serde_json::from_slice(&bytes)?;
        log::info!(
            "recovering abandoned checkpoint [tables={}]",
            manifest.tables.len()
        );
        self.ff.unlink(&self.manifest_path)?;
        self.in_progress.store(false, Ordering::Release);
        Ok(Some(manifest))
    }
}
