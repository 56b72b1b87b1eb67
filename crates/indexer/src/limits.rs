use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const MAX_REFRESH_CONCURRENCY: usize = 32;
pub const DEFAULT_REFRESH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConcurrencySnapshot {
    pub limit: usize,
    pub in_flight: usize,
    pub waiters: usize,
}

pub fn parse_refresh_concurrency(raw: Option<&str>, default_value: usize) -> usize {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
        .clamp(1, MAX_REFRESH_CONCURRENCY)
}

pub fn refresh_concurrency_from_env(default_value: usize) -> usize {
    let raw = std::env::var("CODEPROMPT_REFRESH_CONCURRENCY").ok();
    parse_refresh_concurrency(raw.as_deref(), default_value)
}

/// Bounds how many file reads a refresh runs at once.
#[derive(Clone)]
pub struct RefreshLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    waiters: Arc<AtomicUsize>,
}

impl RefreshLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, MAX_REFRESH_CONCURRENCY);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            waiters: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn snapshot(&self) -> RefreshConcurrencySnapshot {
        RefreshConcurrencySnapshot {
            limit: self.limit,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            waiters: self.waiters.load(Ordering::Relaxed),
        }
    }

    /// `None` only if the semaphore was closed; callers then run unthrottled.
    pub(crate) async fn acquire(&self) -> Option<RefreshPermit> {
        let waiter = WaiterGuard::new(self.waiters.clone());
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        drop(waiter);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(RefreshPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }
}

impl Default for RefreshLimiter {
    fn default() -> Self {
        Self::new(refresh_concurrency_from_env(DEFAULT_REFRESH_CONCURRENCY))
    }
}

pub(crate) struct RefreshPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for RefreshPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct WaiterGuard(Arc<AtomicUsize>);

impl WaiterGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
