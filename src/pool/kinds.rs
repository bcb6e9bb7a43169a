//! Concrete pools
//!
//! Writer, reader, WAL-writer and the two metadata pools share the generic
//! [`ResourcePool`](super::ResourcePool); they differ only in factory and
//! slot policy. Metadata pools hand out cheap read-only views so callers can
//! inspect schema without opening a full reader.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::fs::FilesFacade;
use crate::pool::{Factory, PoolHandle, ResourcePool};
use crate::table::meta::TableMeta;
use crate::table::reader::TableReader;
use crate::table::token::TableToken;
use crate::table::writer::TableWriter;
use crate::wal::sequencer::TableSequencerSet;
use crate::wal::writer::WalWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type WriterPool = ResourcePool<TableWriter>;
pub type ReaderPool = ResourcePool<TableReader>;
pub type WalWriterPool = ResourcePool<WalWriter>;
pub type TableMetadataPool = ResourcePool<TableMeta>;
pub type SequencerMetadataPool = ResourcePool<SequencerMetaView>;

pub type PooledWriter = PoolHandle<TableWriter>;
pub type PooledReader = PoolHandle<TableReader>;
pub type PooledWalWriter = PoolHandle<WalWriter>;

fn table_dir(config: &EngineConfig, token: &TableToken) -> PathBuf {
    config.db_root.join(token.dir_name())
}

/// One writer per table: the slot count of 1 is what enforces writer
/// exclusivity.
pub fn writer_pool(config: &EngineConfig, ff: FilesFacade) -> WriterPool {
    let idle = config.idle_check_interval;
    let config = config.clone();
    let factory: Factory<TableWriter> = Box::new(move |token| {
        TableWriter::open(
            ff,
            config.commit_mode,
            token.clone(),
            &table_dir(&config, token),
        )
    });
    ResourcePool::new("busyWriter", 1, idle, factory)
}

pub fn reader_pool(config: &EngineConfig, ff: FilesFacade) -> ReaderPool {
    let slots = config.reader_pool_slots;
    let idle = config.idle_check_interval;
    let config = config.clone();
    let factory: Factory<TableReader> = Box::new(move |token| {
        TableReader::open(
            ff,
            token.clone(),
            &table_dir(&config, token),
            config.spin_lock_timeout,
            None,
        )
    });
    ResourcePool::new("busyReader", slots, idle, factory)
}

/// WAL writers are not exclusive: each slot owns a distinct `wal<N>`
/// directory, so several can ingest into one table concurrently.
pub fn wal_writer_pool(
    config: &EngineConfig,
    ff: FilesFacade,
    sequencers: Arc<TableSequencerSet>,
    wal_id_generator: Arc<AtomicU32>,
) -> WalWriterPool {
    let slots = config.reader_pool_slots;
    let idle = config.idle_check_interval;
    let config = config.clone();
    let factory: Factory<WalWriter> = Box::new(move |token| {
        let tracker = sequencers.register_table(token);
        let wal_id = wal_id_generator.fetch_add(1, Ordering::AcqRel) + 1;
        WalWriter::open(
            ff,
            config.commit_mode,
            token.clone(),
            &table_dir(&config, token),
            wal_id,
            0,
            tracker,
        )
    });
    ResourcePool::new("busyWalWriter", slots, idle, factory)
}

pub fn table_metadata_pool(config: &EngineConfig, ff: FilesFacade) -> TableMetadataPool {
    let slots = config.metadata_pool_slots;
    let idle = config.idle_check_interval;
    let config = config.clone();
    let factory: Factory<TableMeta> =
        Box::new(move |token| TableMeta::read(&ff, &table_dir(&config, token)));
    ResourcePool::new("busyMetadata", slots, idle, factory)
}

/// Snapshot of a table's sequencer state.
#[derive(Debug, Clone)]
pub struct SequencerMetaView {
    pub token: TableToken,
    pub seq_txn: i64,
    pub writer_txn: i64,
    pub suspended: bool,
}

impl SequencerMetaView {
    fn capture(sequencers: &TableSequencerSet, token: &TableToken) -> Result<Self> {
        let tracker = sequencers.register_table(token);
        Ok(Self {
            token: token.clone(),
            seq_txn: tracker.seq_txn(),
            writer_txn: tracker.writer_txn(),
            suspended: tracker.is_suspended(),
        })
    }
}

pub fn sequencer_metadata_pool(
    config: &EngineConfig,
    sequencers: Arc<TableSequencerSet>,
) -> SequencerMetadataPool {
    let slots = config.metadata_pool_slots;
    let idle = config.idle_check_interval;
    let factory: Factory<SequencerMetaView> =
        Box::new(move |token| SequencerMetaView::capture(&sequencers, token));
    ResourcePool::new("busySequencerMetadata", slots, idle, factory)
}
