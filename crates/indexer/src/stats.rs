use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a content cache across refreshes.
#[derive(Debug, Default)]
pub struct CacheStats {
    refresh_calls: AtomicU64,
    files_read: AtomicU64,
    files_removed: AtomicU64,
    read_failures: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_refresh(&self) {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reads(&self, count: usize) {
        self.files_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_removed(&self, count: usize) {
        self.files_removed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            refresh_calls: self.refresh_calls.load(Ordering::Relaxed),
            files_read: self.files_read.load(Ordering::Relaxed),
            files_removed: self.files_removed.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Number of `refresh` invocations
    pub refresh_calls: u64,

    /// Files whose content was (re)loaded from disk
    pub files_read: u64,

    /// Entries dropped because the file vanished
    pub files_removed: u64,

    pub read_failures: u64,
}
