use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-level counters. Content cache reads are counted separately by
/// the indexer's own stats.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    renders_in_process: AtomicU64,
    renders_offloaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    precompute_runs: AtomicU64,
    generation_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub renders_in_process: u64,
    pub renders_offloaded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub precompute_runs: u64,
    pub generation_failures: u64,
}

impl EngineMetricsSnapshot {
    pub const fn renders(&self) -> u64 {
        self.renders_in_process + self.renders_offloaded
    }
}

impl EngineMetrics {
    pub(crate) fn record_render(&self, offloaded: bool) {
        let counter = if offloaded {
            &self.renders_offloaded
        } else {
            &self.renders_in_process
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_precompute(&self) {
        self.precompute_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            renders_in_process: self.renders_in_process.load(Ordering::Relaxed),
            renders_offloaded: self.renders_offloaded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            precompute_runs: self.precompute_runs.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
        }
    }
}
