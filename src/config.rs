//! Engine configuration and commit modes
//!
//! A single configuration object is threaded through every component; nothing
//! in the engine reads the environment directly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durability mode applied when a WAL commit syncs its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitMode {
    /// Leave the flush to the OS. Fastest, loses the tail on power failure.
    NoSync,
    /// Schedule an asynchronous flush of the event data and sync the index.
    Async,
    /// Full synchronous flush of event and index files before returning.
    Sync,
}

impl Default for CommitMode {
    fn default() -> Self {
        CommitMode::NoSync
    }
}

/// Partition interval for a table's designated timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionBy {
    None,
    Hour,
    Day,
}

pub const MICROS_PER_HOUR: i64 = 3_600_000_000;
pub const MICROS_PER_DAY: i64 = 86_400_000_000;

impl PartitionBy {
    /// Floor `timestamp` (epoch micros) to its partition boundary.
    pub fn floor(&self, timestamp: i64) -> i64 {
        let unit = match self {
            PartitionBy::None => return 0,
            PartitionBy::Hour => MICROS_PER_HOUR,
            PartitionBy::Day => MICROS_PER_DAY,
        };
        timestamp.div_euclid(unit) * unit
    }

    /// Directory name for the partition containing `timestamp`.
    pub fn dir_name(&self, timestamp: i64) -> String {
        match self {
            PartitionBy::None => "default".to_string(),
            PartitionBy::Day => {
                let (y, m, d) = civil_from_micros(self.floor(timestamp));
                format!("{y:04}-{m:02}-{d:02}")
            }
            PartitionBy::Hour => {
                let floored = self.floor(timestamp);
                let (y, m, d) = civil_from_micros(floored);
                let hour = floored.div_euclid(MICROS_PER_HOUR).rem_euclid(24);
                format!("{y:04}-{m:02}-{d:02}T{hour:02}")
            }
        }
    }
}

impl PartitionBy {
    /// Inverse of [`dir_name`](Self::dir_name): partition floor timestamp
    /// from a directory name, or `None` when the name does not parse.
    pub fn parse_dir_name(&self, name: &str) -> Option<i64> {
        match self {
            PartitionBy::None => (name == "default").then_some(0),
            PartitionBy::Day => {
                let (y, m, d) = parse_civil(name)?;
                Some(days_from_civil(y, m, d) * MICROS_PER_DAY)
            }
            PartitionBy::Hour => {
                let (date, hour) = name.split_once('T')?;
                let (y, m, d) = parse_civil(date)?;
                let hour: i64 = hour.parse().ok()?;
                if !(0..24).contains(&hour) {
                    return None;
                }
                Some(days_from_civil(y, m, d) * MICROS_PER_DAY + hour * MICROS_PER_HOUR)
            }
        }
    }
}

fn parse_civil(name: &str) -> Option<(i64, u32, u32)> {
    let mut parts = name.splitn(3, '-');
    let y = parts.next()?.parse().ok()?;
    let m = parts.next()?.parse().ok()?;
    let d = parts.next()?.parse().ok()?;
    ((1..=12).contains(&m) && (1..=31).contains(&d)).then_some((y, m, d))
}

/// Days since epoch from a Gregorian civil date (Howard Hinnant's
/// days_from_civil).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Gregorian civil date from epoch micros (Howard Hinnant's civil_from_days).
fn civil_from_micros(timestamp: i64) -> (i64, u32, u32) {
    let z = timestamp.div_euclid(MICROS_PER_DAY) + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Engine-wide configuration.
///
/// Constructed with [`EngineConfig::new`] and adjusted through the `with_*`
/// setters; every component receives a shared reference.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database root; all table directories and `tables.d` live under it.
    pub db_root: PathBuf,
    /// Durability mode for WAL commits.
    pub commit_mode: CommitMode,
    /// Idle time after which pooled resources become eligible for eviction.
    pub idle_check_interval: Duration,
    /// Upper bound on the column-version seqlock retry loop.
    pub spin_lock_timeout: Duration,
    /// First sleep of the `await_txn` backoff schedule.
    pub await_txn_initial_backoff: Duration,
    /// Backoff cap for `await_txn`.
    pub await_txn_max_backoff: Duration,
    /// Longest accepted table name.
    pub max_file_name_len: usize,
    /// Capacity of the WAL txn notification queue; power of two.
    pub wal_notification_queue_capacity: usize,
    /// Capacity of the async writer command queue; power of two.
    pub writer_command_queue_capacity: usize,
    /// Reader slots per table.
    pub reader_pool_slots: usize,
    /// Metadata view slots per table.
    pub metadata_pool_slots: usize,
    /// Whether materialized-view tracking is installed.
    pub mat_views_enabled: bool,
    /// Whether `create_table` defaults to a WAL-backed table.
    pub wal_enabled_default: bool,
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(db_root: P) -> Self {
        Self {
            db_root: db_root.as_ref().to_path_buf(),
            commit_mode: CommitMode::default(),
            idle_check_interval: Duration::from_secs(30),
            spin_lock_timeout: Duration::from_secs(1),
            await_txn_initial_backoff: Duration::from_millis(10),
            await_txn_max_backoff: Duration::from_millis(250),
            max_file_name_len: 127,
            wal_notification_queue_capacity: 4096,
            writer_command_queue_capacity: 256,
            reader_pool_slots: 4,
            metadata_pool_slots: 4,
            mat_views_enabled: true,
            wal_enabled_default: true,
        }
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    pub fn with_spin_lock_timeout(mut self, timeout: Duration) -> Self {
        self.spin_lock_timeout = timeout;
        self
    }

    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    pub fn with_reader_pool_slots(mut self, slots: usize) -> Self {
        self.reader_pool_slots = slots;
        self
    }

    pub fn with_wal_notification_queue_capacity(mut self, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        self.wal_notification_queue_capacity = capacity;
        self
    }

    pub fn with_mat_views_enabled(mut self, enabled: bool) -> Self {
        self.mat_views_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_floor_day() {
        // 2024-01-01T12:30:00Z
        let ts = 1_704_112_200_000_000;
        let floored = PartitionBy::Day.floor(ts);
        assert_eq!(floored % MICROS_PER_DAY, 0);
        assert!(floored <= ts && ts - floored < MICROS_PER_DAY);
    }

    #[test]
    fn test_partition_dir_names() {
        // 2024-01-01T00:00:00Z
        let ts = 1_704_067_200_000_000;
        assert_eq!(PartitionBy::Day.dir_name(ts), "2024-01-01");
        assert_eq!(PartitionBy::Hour.dir_name(ts + MICROS_PER_HOUR * 5), "2024-01-01T05");
        assert_eq!(PartitionBy::None.dir_name(ts), "default");
    }

    #[test]
    fn test_parse_dir_name_inverts_dir_name() {
        let ts = 1_704_067_200_000_000; // 2024-01-01T00:00:00Z
        for unit in [PartitionBy::Day, PartitionBy::Hour, PartitionBy::None] {
            let floored = unit.floor(ts + 7 * MICROS_PER_HOUR);
            let name = unit.dir_name(floored);
            assert_eq!(unit.parse_dir_name(&name), Some(floored));
        }
        assert_eq!(PartitionBy::Day.parse_dir_name("garbage"), None);
        assert_eq!(PartitionBy::Hour.parse_dir_name("2024-01-01T99"), None);
    }

    #[test]
    fn test_partition_floor_pre_epoch() {
        let ts = -1; // one microsecond before the epoch
        assert_eq!(PartitionBy::Day.floor(ts), -MICROS_PER_DAY);
        assert_eq!(PartitionBy::Day.dir_name(ts), "1969-12-31");
    }
}
