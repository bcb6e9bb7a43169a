//! Message bus
//!
//! Two bounded queues connect committers to the background jobs: one entry
//! per committed WAL txn for the apply job, and serialized writer commands
//! for structural changes dispatched when the caller cannot take the writer
//! itself.
//!
//! The rings use the bounded-MPMC slot-sequence layout. Producers claim a
//! cursor with [`SeqQueue::next`]: a non-negative cursor is a claimed slot,
//! [`CURSOR_FULL`] means the queue is full and the producer must fall back,
//! [`CURSOR_RETRY`] means another producer got in the way and the claim can
//! simply be retried. Publishing (`publish`) writes the value and releases
//! the slot to consumers.

use crate::table::token::TableToken;
use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Queue full; the producer must fall back (a WAL notification falls back to
/// bumping the unpublished-txn count so a rescan picks the txn up).
pub const CURSOR_FULL: i64 = -1;
/// Transient producer contention; retry the claim.
pub const CURSOR_RETRY: i64 = -2;

struct Cell<T> {
    sequence: AtomicI64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC ring with explicit published/consumed sequence pairs.
pub struct SeqQueue<T> {
    cells: Box<[Cell<T>]>,
    mask: i64,
    enqueue_pos: AtomicI64,
    dequeue_pos: AtomicI64,
}

unsafe impl<T: Send> Send for SeqQueue<T> {}
unsafe impl<T: Send> Sync for SeqQueue<T> {}

impl<T> SeqQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "queue capacity must be a power of two");
        let cells = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicI64::new(i as i64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            cells,
            mask: capacity as i64 - 1,
            enqueue_pos: AtomicI64::new(0),
            dequeue_pos: AtomicI64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Claim the next publish cursor. Non-negative: the slot is ours until
    /// [`publish`](Self::publish). [`CURSOR_FULL`]: no room. [`CURSOR_RETRY`]:
    /// lost a race with another producer.
    pub fn next(&self) -> i64 {
        loop {
            let pos = self.enqueue_pos.load(Ordering::Relaxed);
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            match seq - pos {
                0 => {
                    if self
                        .enqueue_pos
                        .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return pos;
                    }
                    return CURSOR_RETRY;
                }
                d if d < 0 => return CURSOR_FULL,
                _ => continue, // stale position, re-read
            }
        }
    }

    /// Write the claimed slot and release it to consumers (the `done` half of
    /// the cursor protocol).
    pub fn publish(&self, cursor: i64, value: T) {
        debug_assert!(cursor >= 0);
        let cell = &self.cells[(cursor & self.mask) as usize];
        unsafe { (*cell.value.get()).write(value) };
        cell.sequence.store(cursor + 1, Ordering::Release);
    }

    /// Pop the next published entry, if any.
    pub fn try_consume(&self) -> Option<T> {
        loop {
            let pos = self.dequeue_pos.load(Ordering::Relaxed);
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            match seq - (pos + 1) {
                0 => {
                    if self
                        .dequeue_pos
                        .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    // Lost the pop race; try the next position.
                }
                d if d < 0 => return None,
                _ => {} // stale position, re-read
            }
        }
    }
}

impl<T> Drop for SeqQueue<T> {
    fn drop(&mut self) {
        while self.try_consume().is_some() {}
    }
}

/// WAL-apply notification: one per committed txn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalTxnNotification {
    pub token: TableToken,
}

/// Serialized structural command destined for the writer thread.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterCommand {
    pub token: TableToken,
    pub cmd_type: i32,
    pub sql: String,
}

pub struct MessageBus {
    wal_notifications: SeqQueue<WalTxnNotification>,
    writer_commands: SeqQueue<WriterCommand>,
    /// Committed txns that could not be enqueued. Held at >= 1 on startup to
    /// force a reconciliation scan.
    unpublished_wal_txn_count: AtomicU64,
}

impl MessageBus {
    pub fn new(notification_capacity: usize, command_capacity: usize) -> Self {
        Self {
            wal_notifications: SeqQueue::new(notification_capacity),
            writer_commands: SeqQueue::new(command_capacity),
            unpublished_wal_txn_count: AtomicU64::new(1),
        }
    }

    /// Enqueue a committed-txn notification. On a full queue the signal is
    /// never lost: the unpublished count is bumped and `false` returned so
    /// the periodic rescan picks the txn up.
    pub fn notify_wal_txn_committed(&self, token: &TableToken) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.wal_notifications.next() {
                CURSOR_FULL => {
                    self.unpublished_wal_txn_count.fetch_add(1, Ordering::AcqRel);
                    return false;
                }
                CURSOR_RETRY => backoff.spin(),
                cursor => {
                    self.wal_notifications.publish(
                        cursor,
                        WalTxnNotification {
                            token: token.clone(),
                        },
                    );
                    return true;
                }
            }
        }
    }

    pub fn next_wal_notification(&self) -> Option<WalTxnNotification> {
        self.wal_notifications.try_consume()
    }

    pub fn publish_writer_command(&self, command: WriterCommand) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.writer_commands.next() {
                CURSOR_FULL => return false,
                CURSOR_RETRY => backoff.spin(),
                cursor => {
                    self.writer_commands.publish(cursor, command);
                    return true;
                }
            }
        }
    }

    pub fn next_writer_command(&self) -> Option<WriterCommand> {
        self.writer_commands.try_consume()
    }

    pub fn unpublished_wal_txn_count(&self) -> u64 {
        self.unpublished_wal_txn_count.load(Ordering::Acquire)
    }

    pub fn bump_unpublished_wal_txn_count(&self) {
        self.unpublished_wal_txn_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Called by the apply job once a full rescan has run.
    pub fn reset_unpublished_wal_txn_count(&self) -> u64 {
        self.unpublished_wal_txn_count.swap(0, Ordering::AcqRel)
    }
}
