//! Per-table sequencer
//!
//! Each WAL table has a tracker holding the highest txn accepted by the
//! sequencer (`seq_txn`) and the highest applied to the physical table
//! (`writer_txn`), with `seq_txn >= writer_txn` always. A table becomes
//! suspended when apply fails and manual intervention is required; suspended
//! tables reject writes and make `await_txn` fail fast.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::table::token::TableToken;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct SeqTxnTracker {
    seq_txn: AtomicI64,
    writer_txn: AtomicI64,
    suspended: AtomicBool,
}

impl SeqTxnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequencer txn.
    pub fn next_seq_txn(&self) -> i64 {
        self.seq_txn.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn seq_txn(&self) -> i64 {
        self.seq_txn.load(Ordering::Acquire)
    }

    pub fn writer_txn(&self) -> i64 {
        self.writer_txn.load(Ordering::Acquire)
    }

    /// Record that the physical table has applied up to `txn`.
    pub fn writer_txn_applied(&self, txn: i64) {
        self.writer_txn.fetch_max(txn, Ordering::AcqRel);
    }

    /// One more txn applied, in order. After a restart the in-memory
    /// sequencer starts at zero while segments still replay, so the accepted
    /// counter is pulled up to keep `seq_txn >= writer_txn`.
    pub fn advance_writer_txn(&self) -> i64 {
        let applied = self.writer_txn.fetch_add(1, Ordering::AcqRel) + 1;
        self.seq_txn.fetch_max(applied, Ordering::AcqRel);
        applied
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    /// Restore counters from recovered on-disk state.
    pub fn init(&self, seq_txn: i64, writer_txn: i64) {
        self.seq_txn.store(seq_txn, Ordering::Release);
        self.writer_txn.store(writer_txn, Ordering::Release);
    }
}

/// The set of sequencer trackers, keyed by table directory so trackers
/// survive renames.
pub struct TableSequencerSet {
    trackers: DashMap<String, Arc<SeqTxnTracker>, ahash::RandomState>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl TableSequencerSet {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            trackers: DashMap::with_hasher(ahash::RandomState::new()),
            initial_backoff: config.await_txn_initial_backoff,
            max_backoff: config.await_txn_max_backoff,
        }
    }

    pub fn register_table(&self, token: &TableToken) -> Arc<SeqTxnTracker> {
        self.trackers
            .entry(token.dir_name().to_string())
            .or_insert_with(|| Arc::new(SeqTxnTracker::new()))
            .clone()
    }

    pub fn drop_table(&self, token: &TableToken) {
        self.trackers.remove(token.dir_name());
    }

    pub fn tracker(&self, token: &TableToken) -> Option<Arc<SeqTxnTracker>> {
        self.trackers.get(token.dir_name()).map(|t| t.clone())
    }

    /// Poll until `writer_txn >= txn`, with exponential backoff from the
    /// configured initial sleep up to the cap. Fails fast on a suspended
    /// table and with a timeout once the deadline elapses.
    pub fn await_txn(&self, token: &TableToken, txn: i64, timeout: Duration) -> Result<()> {
        let tracker = self
            .tracker(token)
            .ok_or_else(|| EngineError::TableDoesNotExist(token.table_name().to_string()))?;
        let deadline = Instant::now() + timeout;
        let mut backoff = self.initial_backoff;
        loop {
            if tracker.is_suspended() {
                return Err(EngineError::TableSuspended(
                    token.table_name().to_string(),
                ));
            }
            if tracker.writer_txn() >= txn {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::TxnTimeout {
                    table: token.table_name().to_string(),
                    txn,
                });
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sequencer() -> TableSequencerSet {
        TableSequencerSet::new(&EngineConfig::new("/tmp/ignored"))
    }

    fn token() -> TableToken {
        TableToken::new("t", "t", 1, true, false)
    }

    #[test]
    fn test_seq_txn_monotonic_and_ahead_of_writer() {
        let tracker = SeqTxnTracker::new();
        assert_eq!(tracker.next_seq_txn(), 1);
        assert_eq!(tracker.next_seq_txn(), 2);
        tracker.writer_txn_applied(1);
        assert!(tracker.seq_txn() >= tracker.writer_txn());
        // Applied marks never regress.
        tracker.writer_txn_applied(1);
        assert_eq!(tracker.writer_txn(), 1);
    }

    #[test]
    fn test_await_txn_returns_once_applied() {
        let seq = sequencer();
        let token = token();
        let tracker = seq.register_table(&token);
        tracker.next_seq_txn();

        let t = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                tracker.writer_txn_applied(1);
            })
        };
        seq.await_txn(&token, 1, Duration::from_secs(2)).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_await_txn_times_out() {
        let seq = sequencer();
        let token = token();
        let tracker = seq.register_table(&token);
        tracker.next_seq_txn();

        let err = seq
            .await_txn(&token, 1, Duration::from_millis(40))
            .unwrap_err();
        assert!(matches!(err, EngineError::TxnTimeout { txn: 1, .. }));
    }

    #[test]
    fn test_await_txn_fails_fast_when_suspended() {
        let seq = sequencer();
        let token = token();
        let tracker = seq.register_table(&token);
        tracker.next_seq_txn();
        tracker.suspend();

        let started = Instant::now();
        let err = seq
            .await_txn(&token, 1, Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, EngineError::TableSuspended(_)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_tracker_survives_rename() {
        let seq = sequencer();
        let token = token();
        let tracker = seq.register_table(&token);
        tracker.next_seq_txn();

        let renamed = token.renamed("u");
        let same = seq.tracker(&renamed).unwrap();
        assert_eq!(same.seq_txn(), 1);
    }
}
