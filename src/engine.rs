//! Engine facade
//!
//! Composes the registry, pools, sequencers, message bus, checkpoint agent
//! and mat-view graph, and orchestrates DDL across them. DDL paths take an
//! exclusive bundle of per-table locks in a fixed global order:
//!
//! ```text
//! create-table lock -> registry -> table metadata pool
//!   -> sequencer metadata pool -> writer pool -> reader pool
//! ```
//!
//! released strictly in reverse. No other code path acquires these in a
//! different order, which is what keeps DDL deadlock-free; individual pool
//! acquisition never blocks (it fails fast with `EntryUnavailable`).

use crate::bus::MessageBus;
use crate::checkpoint::{CheckpointAgent, CheckpointManifest, REASON_CHECKPOINT_IN_PROGRESS};
use crate::config::{EngineConfig, PartitionBy};
use crate::error::{EngineError, Result};
use crate::fs::FilesFacade;
use crate::mat_view::{MatViewDefinition, MatViewGraph};
use crate::pool::kinds::{
    reader_pool, sequencer_metadata_pool, table_metadata_pool, wal_writer_pool, writer_pool,
    PooledReader, PooledWalWriter, PooledWriter, ReaderPool, SequencerMetadataPool,
    TableMetadataPool, WalWriterPool, WriterPool,
};
use crate::pool::PoolHandle;
use crate::table::meta::{ColumnMeta, TableMeta};
use crate::table::registry::{verify_table_name, TableNameRegistry};
use crate::table::token::TableToken;
use crate::table::writer::TableWriter;
use crate::table::NAME_FILE_NAME;
use crate::wal::apply::WalApplyJob;
use crate::wal::events::{SqlEvent, CMD_RENAME_TABLE};
use crate::wal::sequencer::TableSequencerSet;
use ahash::AHashSet;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Everything `create_table` / `create_mat_view` need to know.
#[derive(Debug, Clone)]
pub struct CreateTableOp {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub partition_by: PartitionBy,
    /// `None` takes the configured default.
    pub wal: Option<bool>,
    pub if_not_exists: bool,
}

impl CreateTableOp {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnMeta>, partition_by: PartitionBy) -> Self {
        Self {
            name: name.into(),
            columns,
            partition_by,
            wal: None,
            if_not_exists: false,
        }
    }

    pub fn non_wal(mut self) -> Self {
        self.wal = Some(false);
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }
}

pub struct Engine {
    config: EngineConfig,
    ff: FilesFacade,
    registry: TableNameRegistry,
    sequencers: Arc<TableSequencerSet>,
    bus: MessageBus,
    checkpoint: CheckpointAgent,
    mat_views: MatViewGraph,
    writer_pool: WriterPool,
    reader_pool: ReaderPool,
    wal_writer_pool: WalWriterPool,
    table_metadata_pool: TableMetadataPool,
    sequencer_metadata_pool: SequencerMetadataPool,
    apply_job: WalApplyJob,
    table_id_generator: AtomicI32,
    create_locks: Mutex<AHashSet<String>>,
}

impl Engine {
    /// Open the engine over `config.db_root`, recovering registry and
    /// checkpoint state from any previous incarnation.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let ff = FilesFacade::new();
        ff.mkdirs(&config.db_root)?;

        let registry = TableNameRegistry::open(ff, &config.db_root)?;
        registry.reconcile()?;

        let checkpoint = CheckpointAgent::new(ff, &config.db_root);
        checkpoint.checkpoint_recover()?;

        let sequencers = Arc::new(TableSequencerSet::new(&config));
        let wal_id_generator = Arc::new(AtomicU32::new(0));

        let max_id = registry
            .live_tokens()
            .iter()
            .chain(registry.dropped_tokens().iter())
            .map(|t| t.table_id())
            .max()
            .unwrap_or(0);
        for token in registry.live_tokens() {
            if token.is_wal() {
                sequencers.register_table(&token);
            }
        }

        let mat_views = if config.mat_views_enabled {
            MatViewGraph::new()
        } else {
            MatViewGraph::disabled()
        };

        let engine = Self {
            writer_pool: writer_pool(&config, ff),
            reader_pool: reader_pool(&config, ff),
            wal_writer_pool: wal_writer_pool(&config, ff, sequencers.clone(), wal_id_generator),
            table_metadata_pool: table_metadata_pool(&config, ff),
            sequencer_metadata_pool: sequencer_metadata_pool(&config, sequencers.clone()),
            bus: MessageBus::new(
                config.wal_notification_queue_capacity,
                config.writer_command_queue_capacity,
            ),
            apply_job: WalApplyJob::new(ff),
            table_id_generator: AtomicI32::new(max_id),
            create_locks: Mutex::new(AHashSet::new()),
            registry,
            sequencers,
            checkpoint,
            mat_views,
            config,
            ff,
        };
        log::info!(
            "engine open [root={},tables={}]",
            engine.config.db_root.display(),
            engine.registry.live_tokens().len()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn mat_view_graph(&self) -> &MatViewGraph {
        &self.mat_views
    }

    pub fn sequencers(&self) -> &TableSequencerSet {
        &self.sequencers
    }

    fn table_dir(&self, token: &TableToken) -> PathBuf {
        self.config.db_root.join(token.dir_name())
    }

    pub fn verify_table_name(&self, name: &str) -> Result<()> {
        verify_table_name(name, self.config.max_file_name_len)
    }

    pub fn get_table_token_if_exists(&self, name: &str) -> Option<TableToken> {
        self.registry.get_token_if_exists(name)
    }

    // ---------------------------------------------------------------- DDL

    pub fn create_table(&self, op: CreateTableOp) -> Result<TableToken> {
        self.create_table_ext(op, false)
    }

    /// Create a materialized view over `base`. The view is a WAL table whose
    /// token carries the mat-view flag; the dependency edge lands in the
    /// graph.
    pub fn create_mat_view(
        &self,
        op: CreateTableOp,
        base: &TableToken,
        view_sql: impl Into<String>,
    ) -> Result<TableToken> {
        if !self.registry.is_current(base) {
            return Err(EngineError::TableDoesNotExist(
                base.table_name().to_string(),
            ));
        }
        let definition = MatViewDefinition {
            view_sql: view_sql.into(),
            base_table_dir: base.dir_name().to_string(),
        };
        let token = self.create_table_ext(op, true)?;
        self.mat_views.add_view(&token, base, definition);
        Ok(token)
    }

    fn create_table_ext(&self, op: CreateTableOp, is_mat_view: bool) -> Result<TableToken> {
        self.verify_table_name(&op.name)?;
        if op.columns.is_empty() {
            return Err(EngineError::InvalidTableName(format!(
                "{}: table requires at least one column",
                op.name
            )));
        }
        let is_wal = op.wal.unwrap_or(self.config.wal_enabled_default) || is_mat_view;
        let table_id = self.table_id_generator.fetch_add(1, Ordering::AcqRel) + 1;
        let dir_name = format!("{}~{}", op.name, table_id);

        let backoff = Backoff::new();
        loop {
            let Some(token) =
                self.registry
                    .lock_table_name(&op.name, &dir_name, table_id, is_wal, is_mat_view)
            else {
                if !op.if_not_exists {
                    return Err(EngineError::TableExists(op.name.clone()));
                }
                if let Some(existing) = self.registry.get_token_if_exists(&op.name) {
                    return Ok(existing);
                }
                // Reserved by a concurrent create: wait for it to settle.
                backoff.snooze();
                continue;
            };

            self.acquire_create_lock(&op.name);
            let result = self.create_table_files(&token, &op);
            if result.is_err() && token.is_wal() {
                self.sequencers.drop_table(&token);
            }
            self.registry.unlock_table_name(&token);
            self.release_create_lock(&op.name);
            return result;
        }
    }

    fn create_table_files(&self, token: &TableToken, op: &CreateTableOp) -> Result<TableToken> {
        self.lock_all_pools(token)?;
        let result = (|| {
            let dir = self.table_dir(token);
            if self.ff.exists(&dir) {
                return Err(EngineError::NameReserved(op.name.clone()));
            }
            let meta = TableMeta::new(
                token.table_id(),
                token.is_wal(),
                op.partition_by,
                op.columns.clone(),
            );
            TableWriter::create(&self.ff, &dir, &meta)?;
            self.ff
                .write_atomic(&dir.join(NAME_FILE_NAME), op.name.as_bytes())?;
            if token.is_wal() {
                self.sequencers.register_table(token);
            }
            self.registry.register_name(token)?;
            log::info!("created table [table={token},wal={}]", token.is_wal());
            Ok(token.clone())
        })();
        self.unlock_all_pools(token);
        result
    }

    pub fn drop_table_or_mat_view(&self, token: &TableToken) -> Result<()> {
        if token.is_wal() {
            if !self.registry.drop_table(token)? {
                return Err(EngineError::TableDoesNotExist(
                    token.table_name().to_string(),
                ));
            }
            if token.is_mat_view() {
                self.mat_views.drop_view_if_exists(token);
            } else {
                self.mat_views.drop_base_table(token);
            }
            log::info!("dropped wal table, directory removal deferred [table={token}]");
            return Ok(());
        }

        self.lock_all_pools(token)?;
        let result = (|| {
            if !self.registry.drop_table(token)? {
                return Err(EngineError::TableDoesNotExist(
                    token.table_name().to_string(),
                ));
            }
            self.remove_table_dir(token)?;
            self.registry.purge(token);
            self.mat_views.drop_base_table(token);
            log::info!("dropped table [table={token}]");
            Ok(())
        })();
        self.unlock_all_pools(token);
        if result.is_ok() {
            self.purge_pools(token);
        }
        result
    }

    /// Remove directories of WAL tables dropped earlier. Skips tables whose
    /// pools are still busy; returns how many were purged.
    pub fn purge_dropped_tables(&self) -> usize {
        let mut purged = 0;
        for token in self.registry.dropped_tokens() {
            if self.lock_all_pools(&token).is_err() {
                continue;
            }
            let removed = self.remove_table_dir(&token);
            if removed.is_ok() {
                self.registry.purge(&token);
                self.sequencers.drop_table(&token);
                purged += 1;
            }
            self.unlock_all_pools(&token);
            match removed {
                Ok(()) => self.purge_pools(&token),
                Err(err) => {
                    log::error!("CRITICAL: failed to purge dropped table [table={token}]: {err}");
                }
            }
        }
        purged
    }

    fn remove_table_dir(&self, token: &TableToken) -> Result<()> {
        let dir = self.table_dir(token);
        if !self.ff.exists(&dir) {
            return Ok(());
        }
        self.ff.remove_dir_all(&dir).map_err(|err| {
            EngineError::critical(format!("could not remove table directory [table={token}]: {err}"))
        })
    }

    fn purge_pools(&self, token: &TableToken) {
        self.writer_pool.purge(token);
        self.reader_pool.purge(token);
        self.wal_writer_pool.purge(token);
        self.table_metadata_pool.purge(token);
        self.sequencer_metadata_pool.purge(token);
    }

    /// Rename a table.
    ///
    /// WAL tables use the alias trick: the rename intent goes into the WAL
    /// first, then the new name is installed as an alias of the same
    /// directory, then the old name is removed. A crash in between leaves
    /// exactly one resolvable name and the directory untouched.
    pub fn rename_table(&self, old_name: &str, new_name: &str) -> Result<TableToken> {
        self.verify_table_name(new_name)?;
        let token = self
            .registry
            .get_token_if_exists(old_name)
            .ok_or_else(|| EngineError::TableDoesNotExist(old_name.to_string()))?;

        if token.is_wal() {
            {
                let mut wal = self.wal_writer_pool.get(&token)?;
                wal.commit_sql(SqlEvent {
                    cmd_type: CMD_RENAME_TABLE,
                    sql: format!("rename table {old_name} to {new_name}"),
                    rnd_seed0: 0,
                    rnd_seed1: 0,
                    indexed_vars: vec![],
                    named_vars: vec![],
                })?;
            }
            let new_token = self.registry.add_table_alias(new_name, &token)?;
            self.registry.remove_name(&token)?;
            self.bus.notify_wal_txn_committed(&token);
            log::info!("renamed wal table [from={old_name},to={new_name}]");
            return Ok(new_token);
        }

        self.lock_all_pools(&token)?;
        let result = (|| {
            let new_dir = format!("{}~{}", new_name, token.table_id());
            let from = self.table_dir(&token);
            let to = self.config.db_root.join(&new_dir);
            self.ff.rename(&from, &to).map_err(|err| {
                EngineError::critical(format!("rename failed [table={token}]: {err}"))
            })?;
            self.ff
                .write_atomic(&to.join(NAME_FILE_NAME), new_name.as_bytes())?;
            let new_token = TableToken::new(
                new_name,
                new_dir,
                token.table_id(),
                false,
                token.is_mat_view(),
            );
            self.registry.rename(&token, &new_token)?;
            log::info!("renamed table [from={old_name},to={new_name}]");
            Ok(new_token)
        })();
        self.unlock_all_pools(&token);
        if result.is_ok() {
            self.purge_pools(&token);
        }
        result
    }

    // ------------------------------------------------------- pool surface

    /// Take a reader snapshot. A stale `(table_id, metadata_version)` pair
    /// fails with `TableReferenceOutOfDate` so query engines recompile.
    pub fn get_reader(
        &self,
        token: &TableToken,
        metadata_version: Option<i64>,
    ) -> Result<PooledReader> {
        if !self.registry.is_current(token) {
            return Err(self.stale_token_error(token, metadata_version));
        }
        let mut handle = match self.reader_pool.get(token) {
            Ok(handle) => handle,
            Err(err) if err.is_critical() => self.repair_and_reopen(token, err)?,
            Err(err) => return Err(err),
        };
        if let Err(err) = handle.reload() {
            if !err.is_critical() {
                return Err(err);
            }
            handle.close_resource();
            handle = self.repair_and_reopen(token, err)?;
        }
        if let Some(requested) = metadata_version {
            let meta = handle.meta();
            if meta.metadata_version != requested || meta.table_id != token.table_id() {
                return Err(EngineError::TableReferenceOutOfDate {
                    table: token.table_name().to_string(),
                    expected_id: token.table_id(),
                    actual_id: meta.table_id,
                    expected_version: requested,
                    actual_version: meta.metadata_version,
                });
            }
        }
        Ok(handle)
    }

    /// Repair path for a reader that failed to open: briefly take the writer
    /// (its open runs recovery), then retry the reader once.
    fn repair_and_reopen(&self, token: &TableToken, original: EngineError) -> Result<PooledReader> {
        log::info!("attempting table repair [table={token}]");
        match self.writer_pool.get(token) {
            Ok(mut writer) => {
                if writer.repair().is_err() {
                    return Err(original);
                }
            }
            Err(_) => return Err(original),
        }
        match self.reader_pool.get(token) {
            Ok(mut handle) => {
                handle.reload()?;
                Ok(handle)
            }
            Err(_) => Err(original),
        }
    }

    fn stale_token_error(&self, token: &TableToken, metadata_version: Option<i64>) -> EngineError {
        match self.registry.get_token_if_exists(token.table_name()) {
            Some(current) => EngineError::TableReferenceOutOfDate {
                table: token.table_name().to_string(),
                expected_id: token.table_id(),
                actual_id: current.table_id(),
                expected_version: metadata_version.unwrap_or(-1),
                actual_version: -1,
            },
            None => EngineError::TableDoesNotExist(token.table_name().to_string()),
        }
    }

    /// The single table writer. `reason` tags the acquisition for
    /// diagnostics when someone else holds it.
    pub fn get_writer(&self, token: &TableToken, reason: &'static str) -> Result<PooledWriter> {
        if !self.registry.is_current(token) {
            return Err(self.stale_token_error(token, None));
        }
        self.writer_pool.get(token).map_err(|err| match err {
            EngineError::EntryUnavailable { table, .. } => {
                EngineError::EntryUnavailable { table, reason }
            }
            other => other,
        })
    }

    pub fn get_wal_writer(&self, token: &TableToken) -> Result<PooledWalWriter> {
        if !token.is_wal() {
            return Err(EngineError::NotWalTable(token.table_name().to_string()));
        }
        if !self.registry.is_current(token) {
            return Err(self.stale_token_error(token, None));
        }
        self.wal_writer_pool.get(token)
    }

    /// Cheap schema view without opening a full reader.
    pub fn get_table_metadata(&self, token: &TableToken) -> Result<PoolHandle<TableMeta>> {
        self.table_metadata_pool.get(token)
    }

    pub fn get_sequencer_metadata(
        &self,
        token: &TableToken,
    ) -> Result<PoolHandle<crate::pool::kinds::SequencerMetaView>> {
        self.sequencer_metadata_pool.get(token)
    }

    // ----------------------------------------------------- reader locking

    /// Freeze reader acquisition for a table. Refused while a checkpoint is
    /// in progress so the snapshot's reader set stays stable.
    pub fn lock_readers(&self, token: &TableToken) -> Result<()> {
        if self.checkpoint.is_in_progress() {
            return Err(EngineError::EntryUnavailable {
                table: token.table_name().to_string(),
                reason: REASON_CHECKPOINT_IN_PROGRESS,
            });
        }
        self.reader_pool
            .lock(token)
            .map_err(|reason| EngineError::EntryUnavailable {
                table: token.table_name().to_string(),
                reason,
            })
    }

    pub fn unlock_readers(&self, token: &TableToken) {
        self.reader_pool.unlock(token);
    }

    pub fn lock_readers_and_metadata(&self, token: &TableToken) -> Result<()> {
        self.table_metadata_pool
            .lock(token)
            .map_err(|reason| EngineError::EntryUnavailable {
                table: token.table_name().to_string(),
                reason,
            })?;
        if let Err(err) = self.lock_readers(token) {
            self.table_metadata_pool.unlock(token);
            return Err(err);
        }
        Ok(())
    }

    pub fn unlock_readers_and_metadata(&self, token: &TableToken) {
        self.reader_pool.unlock(token);
        self.table_metadata_pool.unlock(token);
    }

    /// Acquire the full DDL lock bundle in the global order.
    fn lock_all_pools(&self, token: &TableToken) -> Result<()> {
        let busy = |reason: &'static str| EngineError::EntryUnavailable {
            table: token.table_name().to_string(),
            reason,
        };
        self.table_metadata_pool.lock(token).map_err(busy)?;
        if let Err(reason) = self.sequencer_metadata_pool.lock(token) {
            self.table_metadata_pool.unlock(token);
            return Err(busy(reason));
        }
        if let Err(reason) = self.writer_pool.lock(token) {
            self.sequencer_metadata_pool.unlock(token);
            self.table_metadata_pool.unlock(token);
            return Err(busy(reason));
        }
        if let Err(err) = self.lock_readers(token) {
            self.writer_pool.unlock(token);
            self.sequencer_metadata_pool.unlock(token);
            self.table_metadata_pool.unlock(token);
            return Err(err);
        }
        Ok(())
    }

    fn unlock_all_pools(&self, token: &TableToken) {
        self.reader_pool.unlock(token);
        self.writer_pool.unlock(token);
        self.sequencer_metadata_pool.unlock(token);
        self.table_metadata_pool.unlock(token);
    }

    fn acquire_create_lock(&self, name: &str) {
        let backoff = Backoff::new();
        loop {
            if self.create_locks.lock().insert(name.to_string()) {
                return;
            }
            backoff.snooze();
        }
    }

    fn release_create_lock(&self, name: &str) {
        self.create_locks.lock().remove(name);
    }

    // ------------------------------------------------------------ WAL flow

    /// Signal the apply job. On a full queue the unpublished count is bumped
    /// instead and `false` comes back; the periodic rescan picks the txn up.
    pub fn notify_wal_txn_committed(&self, token: &TableToken) -> bool {
        self.bus.notify_wal_txn_committed(token)
    }

    pub fn await_txn(&self, token: &TableToken, txn: i64, timeout: Duration) -> Result<()> {
        self.sequencers.await_txn(token, txn, timeout)
    }

    /// Drain the notification queue and merge pending WAL transactions into
    /// table storage. A positive unpublished count forces a rescan of every
    /// WAL table so missed signals are never lost. Returns the number of
    /// transactions applied.
    pub fn apply_wal(&self) -> u64 {
        let mut applied = 0;
        if self.bus.reset_unpublished_wal_txn_count() > 0 {
            for token in self.registry.live_tokens() {
                if token.is_wal() {
                    applied += self.apply_table(&token);
                }
            }
        }
        // One pass per notification: apply is idempotent and cheap when a
        // table has nothing pending, and coalescing here could drop a txn
        // committed while its table was mid-apply.
        while let Some(notification) = self.bus.next_wal_notification() {
            applied += self.apply_table(&notification.token);
        }
        applied
    }

    /// Apply one table. Failures suspend the table rather than crash the
    /// engine; a busy writer re-queues via the unpublished count.
    fn apply_table(&self, token: &TableToken) -> u64 {
        let tracker = self.sequencers.register_table(token);
        if tracker.is_suspended() {
            return 0;
        }
        let mut writer = match self.writer_pool.get(token) {
            Ok(writer) => writer,
            Err(err) if err.is_entry_unavailable() => {
                self.bus.bump_unpublished_wal_txn_count();
                return 0;
            }
            Err(err) => {
                log::error!("CRITICAL: apply cannot open writer [table={token}]: {err}");
                tracker.suspend();
                return 0;
            }
        };
        match self.apply_job.apply_table(
            token,
            &self.table_dir(token),
            &mut writer,
            &tracker,
            &self.mat_views,
        ) {
            Ok(count) => count,
            Err(err) => {
                log::error!("CRITICAL: wal apply failed, suspending [table={token}]: {err}");
                tracker.suspend();
                0
            }
        }
    }

    /// Lift a suspension after manual intervention and schedule a rescan.
    pub fn resume_table(&self, token: &TableToken) {
        if let Some(tracker) = self.sequencers.tracker(token) {
            tracker.resume();
            self.bus.bump_unpublished_wal_txn_count();
        }
    }

    // ---------------------------------------------------------- checkpoint

    pub fn checkpoint_create(&self) -> Result<()> {
        self.checkpoint.checkpoint_create(&self.registry.live_tokens())
    }

    pub fn checkpoint_release(&self) -> Result<()> {
        self.checkpoint.checkpoint_release()
    }

    pub fn checkpoint_recover(&self) -> Result<Option<CheckpointManifest>> {
        self.checkpoint.checkpoint_recover()
    }

    // --------------------------------------------------------- maintenance

    /// Idle-resource reaper; true when any pool freed something, so the
    /// maintenance job can report useful work done.
    pub fn release_inactive(&self) -> bool {
        let mut freed = self.writer_pool.release_inactive();
        freed |= self.reader_pool.release_inactive();
        freed |= self.wal_writer_pool.release_inactive();
        freed |= self.table_metadata_pool.release_inactive();
        freed |= self.sequencer_metadata_pool.release_inactive();
        freed
    }

    pub fn busy_reader_count(&self) -> usize {
        self.reader_pool.busy_count()
    }

    pub fn busy_writer_count(&self) -> usize {
        self.writer_pool.busy_count()
    }

    /// Close every pool; released resources are dropped rather than cached.
    pub fn close(&self) {
        self.writer_pool.close();
        self.reader_pool.close();
        self.wal_writer_pool.close();
        self.table_metadata_pool.close();
        self.sequencer_metadata_pool.close();
        log::info!("engine closed");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitMode;
    use crate::table::meta::ColumnType;
    use crate::table::writer::Value;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tempfile::TempDir;

    const DAY0: i64 = 1_704_067_200_000_000; // 2024-01-01T00:00:00Z

    fn engine(tmp: &TempDir) -> Engine {
        Engine::open(EngineConfig::new(tmp.path()).with_commit_mode(CommitMode::Sync)).unwrap()
    }

    fn int_ts_columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("a", ColumnType::Int),
            ColumnMeta::new("ts", ColumnType::Timestamp),
        ]
    }

    #[test]
    fn test_create_write_read() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        {
            let mut writer = engine.get_writer(&token, "insert").unwrap();
            writer
                .append_row(vec![Value::Int(42), Value::Timestamp(DAY0)])
                .unwrap();
            writer.commit().unwrap();
        }

        let reader = engine.get_reader(&token, None).unwrap();
        let rows = reader.read_all().unwrap();
        assert_eq!(rows, vec![vec![Value::Int(42), Value::Timestamp(DAY0)]]);
    }

    #[test]
    fn test_create_existing_name_fails_unless_if_not_exists() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);

        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();
        assert!(matches!(
            engine.create_table(
                CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal()
            ),
            Err(EngineError::TableExists(_))
        ));
        let again = engine
            .create_table(
                CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day)
                    .non_wal()
                    .if_not_exists(),
            )
            .unwrap();
        assert_eq!(again, token);
    }

    #[test]
    fn test_concurrent_add_column_and_queries() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(engine(&tmp));

        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();
        {
            let mut writer = engine.get_writer(&token, "seed").unwrap();
            for i in 0..1000 {
                writer
                    .append_row(vec![Value::Int(i), Value::Timestamp(DAY0 + i as i64)])
                    .unwrap();
            }
            writer.commit().unwrap();
        }

        let queries_run = Arc::new(AtomicUsize::new(0));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            let token = token.clone();
            let queries_run = queries_run.clone();
            readers.push(thread::spawn(move || {
                while queries_run.load(Ordering::Acquire) < 100 {
                    let Ok(reader) = engine.get_reader(&token, None) else {
                        thread::yield_now();
                        continue;
                    };
                    let rows = reader.read_all().unwrap();
                    assert_eq!(rows.len(), 1000);
                    for (i, row) in rows.iter().enumerate() {
                        assert_eq!(row[0], Value::Int(i as i32));
                        // Column b, if visible, reads null for seeded rows.
                        if row.len() == 3 {
                            assert_eq!(row[2], Value::Null);
                        }
                    }
                    queries_run.fetch_add(1, Ordering::AcqRel);
                }
            }));
        }

        {
            let mut writer = engine.get_writer(&token, "alter").unwrap();
            writer.add_column("b", ColumnType::Double).unwrap();
        }
        for handle in readers {
            handle.join().unwrap();
        }

        let reader = engine.get_reader(&token, None).unwrap();
        assert_eq!(reader.column_top(DAY0, 2), 1000);
    }

    #[test]
    fn test_wal_rename_survives_crash() {
        let tmp = TempDir::new().unwrap();
        let dir_name;
        {
            let engine = engine(&tmp);
            let token = engine
                .create_table(CreateTableOp::new("x", int_ts_columns(), PartitionBy::Day))
                .unwrap();
            assert!(token.is_wal());
            dir_name = token.dir_name().to_string();
            drop(engine);

            // Crash window: the alias for the new name was appended but the
            // old name was never removed.
            let registry = TableNameRegistry::open(FilesFacade::new(), tmp.path()).unwrap();
            let token = registry.get_token_if_exists("x").unwrap();
            registry.add_table_alias("y", &token).unwrap();
        }

        let engine = engine(&tmp);
        // Exactly one of the names resolves, deterministically the newest,
        // and the directory never moved.
        assert!(engine.get_table_token_if_exists("x").is_none());
        let survivor = engine.get_table_token_if_exists("y").unwrap();
        assert_eq!(survivor.dir_name(), dir_name);
        assert!(tmp.path().join(&dir_name).exists());
    }

    #[test]
    fn test_wal_rename_completes() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("x", int_ts_columns(), PartitionBy::Day))
            .unwrap();

        let renamed = engine.rename_table("x", "y").unwrap();
        assert_eq!(renamed.dir_name(), token.dir_name());
        assert_eq!(renamed.table_id(), token.table_id());
        assert!(engine.get_table_token_if_exists("x").is_none());
        assert_eq!(engine.get_table_token_if_exists("y").unwrap(), renamed);
    }

    #[test]
    fn test_non_wal_rename_moves_directory() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("x", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();
        {
            let mut writer = engine.get_writer(&token, "seed").unwrap();
            writer
                .append_row(vec![Value::Int(1), Value::Timestamp(DAY0)])
                .unwrap();
            writer.commit().unwrap();
        }

        let renamed = engine.rename_table("x", "y").unwrap();
        assert_ne!(renamed.dir_name(), token.dir_name());
        assert!(!tmp.path().join(token.dir_name()).exists());

        let reader = engine.get_reader(&renamed, None).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_pool_exhaustion_and_retry() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(
            EngineConfig::new(tmp.path())
                .with_commit_mode(CommitMode::Sync)
                .with_reader_pool_slots(4),
        )
        .unwrap();
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        let mut held: Vec<_> = (0..4)
            .map(|_| engine.get_reader(&token, None).unwrap())
            .collect();
        assert!(matches!(
            engine.get_reader(&token, None),
            Err(EngineError::EntryUnavailable { .. })
        ));
        assert_eq!(engine.busy_reader_count(), 4);

        // Release one and the retry succeeds.
        held.pop();
        engine.get_reader(&token, None).unwrap();
    }

    #[test]
    fn test_writer_exclusivity() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        let writer = engine.get_writer(&token, "first").unwrap();
        let err = engine.get_writer(&token, "second").unwrap_err();
        assert!(matches!(
            err,
            EngineError::EntryUnavailable { reason: "second", .. }
        ));
        drop(writer);
        engine.get_writer(&token, "third").unwrap();
    }

    #[test]
    fn test_wal_writer_refused_for_non_wal_table() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        let err = engine.get_wal_writer(&token).unwrap_err();
        assert!(matches!(err, EngineError::NotWalTable(_)));
        // Caller mistake, not a data-integrity failure.
        assert!(!err.is_critical());
    }

    #[test]
    fn test_checkpoint_blocks_reader_locks() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        engine.checkpoint_create().unwrap();
        let err = engine.lock_readers(&token).unwrap_err();
        assert!(matches!(
            err,
            EngineError::EntryUnavailable {
                reason: REASON_CHECKPOINT_IN_PROGRESS,
                ..
            }
        ));
        // DDL that needs the reader lock is blocked too.
        assert!(matches!(
            engine.drop_table_or_mat_view(&token),
            Err(EngineError::EntryUnavailable { .. })
        ));

        engine.checkpoint_release().unwrap();
        engine.lock_readers(&token).unwrap();
        engine.unlock_readers(&token);
    }

    #[test]
    fn test_wal_ingest_apply_await() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("trades", int_ts_columns(), PartitionBy::Day))
            .unwrap();

        let seq_txn = {
            let mut wal = engine.get_wal_writer(&token).unwrap();
            wal.append_row(vec![Value::Int(7), Value::Timestamp(DAY0)])
                .unwrap();
            wal.commit().unwrap().unwrap()
        };
        assert!(engine.notify_wal_txn_committed(&token));

        // Not yet applied: reader sees nothing, await times out.
        assert_eq!(
            engine.get_reader(&token, None).unwrap().read_all().unwrap().len(),
            0
        );
        assert!(engine
            .await_txn(&token, seq_txn, Duration::from_millis(30))
            .is_err());

        assert!(engine.apply_wal() >= 1);
        engine
            .await_txn(&token, seq_txn, Duration::from_secs(1))
            .unwrap();

        let reader = engine.get_reader(&token, None).unwrap();
        assert_eq!(
            reader.read_all().unwrap(),
            vec![vec![Value::Int(7), Value::Timestamp(DAY0)]]
        );
    }

    #[test]
    fn test_unpublished_rescan_catches_missed_notifications() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day))
            .unwrap();

        {
            let mut wal = engine.get_wal_writer(&token).unwrap();
            wal.append_row(vec![Value::Int(1), Value::Timestamp(DAY0)])
                .unwrap();
            wal.commit().unwrap().unwrap();
        }
        // Notification intentionally skipped; the startup floor of the
        // unpublished count (>= 1) forces the rescan to find the txn anyway.
        assert!(engine.message_bus().unpublished_wal_txn_count() >= 1);
        assert_eq!(engine.apply_wal(), 1);
        assert_eq!(
            engine.get_reader(&token, None).unwrap().read_all().unwrap().len(),
            1
        );
    }

    #[test]
    fn test_stale_reader_reference_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        engine.get_reader(&token, Some(0)).unwrap();
        {
            let mut writer = engine.get_writer(&token, "alter").unwrap();
            writer.add_column("b", ColumnType::Double).unwrap();
        }
        assert!(matches!(
            engine.get_reader(&token, Some(0)),
            Err(EngineError::TableReferenceOutOfDate { .. })
        ));
        engine.get_reader(&token, Some(1)).unwrap();

        // A token for a dropped-and-recreated name is stale as well.
        engine.drop_table_or_mat_view(&token).unwrap();
        let recreated = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();
        assert!(matches!(
            engine.get_reader(&token, None),
            Err(EngineError::TableReferenceOutOfDate { .. })
        ));
        engine.get_reader(&recreated, None).unwrap();
    }

    #[test]
    fn test_drop_wal_table_defers_directory_removal() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day))
            .unwrap();
        let dir = tmp.path().join(token.dir_name());

        engine.drop_table_or_mat_view(&token).unwrap();
        assert!(engine.get_table_token_if_exists("t").is_none());
        assert!(dir.exists());

        assert_eq!(engine.purge_dropped_tables(), 1);
        assert!(!dir.exists());
    }

    #[test]
    fn test_mat_view_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let base = engine
            .create_table(CreateTableOp::new("base", int_ts_columns(), PartitionBy::Day))
            .unwrap();
        let view = engine
            .create_mat_view(
                CreateTableOp::new("base_1h", int_ts_columns(), PartitionBy::Day),
                &base,
                "select a, ts from base sample by 1h",
            )
            .unwrap();
        assert!(view.is_mat_view());

        // Applying a base txn fans out a refresh task.
        {
            let mut wal = engine.get_wal_writer(&base).unwrap();
            wal.append_row(vec![Value::Int(1), Value::Timestamp(DAY0)])
                .unwrap();
            wal.commit().unwrap().unwrap();
        }
        engine.notify_wal_txn_committed(&base);
        engine.apply_wal();

        let task = engine.mat_view_graph().next_refresh_task().unwrap();
        assert_eq!(task.view.dir_name(), view.dir_name());
        assert_eq!(task.base.dir_name(), base.dir_name());

        // Dropping the base invalidates the view.
        engine.drop_table_or_mat_view(&base).unwrap();
        let state = engine.mat_view_graph().view_state(&view).unwrap();
        assert!(state.is_invalid());
    }

    #[test]
    fn test_suspension_on_apply_failure() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day))
            .unwrap();

        {
            let mut wal = engine.get_wal_writer(&token).unwrap();
            wal.append_row(vec![Value::Int(1), Value::Timestamp(DAY0)])
                .unwrap();
            wal.commit().unwrap().unwrap();
        }
        // Corrupt the segment's column data so apply fails.
        let seg = crate::wal::segment_dir(&tmp.path().join(token.dir_name()), 1, 0);
        std::fs::write(seg.join("a.d"), b"x").unwrap();

        engine.notify_wal_txn_committed(&token);
        engine.apply_wal();
        let tracker = engine.sequencers().tracker(&token).unwrap();
        assert!(tracker.is_suspended());

        // Suspended tables fail writes fast.
        let mut wal = engine.get_wal_writer(&token).unwrap();
        assert!(matches!(
            wal.append_row(vec![Value::Int(2), Value::Timestamp(DAY0)]),
            Err(EngineError::TableSuspended(_))
        ));
    }

    #[test]
    fn test_registry_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let token = {
            let engine = engine(&tmp);
            engine
                .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day))
                .unwrap()
        };
        let engine = engine(&tmp);
        let reloaded = engine.get_table_token_if_exists("t").unwrap();
        assert_eq!(reloaded, token);

        // Table ids never repeat across restarts.
        let other = engine
            .create_table(CreateTableOp::new("u", int_ts_columns(), PartitionBy::Day))
            .unwrap();
        assert!(other.table_id() > token.table_id());
    }

    #[test]
    fn test_release_inactive_reports_work() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(
            EngineConfig::new(tmp.path())
                .with_commit_mode(CommitMode::Sync)
                .with_idle_check_interval(Duration::from_millis(0)),
        )
        .unwrap();
        let token = engine
            .create_table(CreateTableOp::new("t", int_ts_columns(), PartitionBy::Day).non_wal())
            .unwrap();

        drop(engine.get_reader(&token, None).unwrap());
        assert!(engine.release_inactive());
        assert!(!engine.release_inactive());
    }
}
