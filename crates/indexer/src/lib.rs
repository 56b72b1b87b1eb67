//! # Code Prompt Indexer
//!
//! Keeps a project's file set and file contents current.
//!
//! ## Pipeline
//!
//! ```text
//! Directory
//!     │
//!     ├──> FileScanner (deny/keep/.gitignore aware)
//!     │      └─> ordered inventory
//!     │
//!     ├──> ContentCache (mtime-checked, parallel reads)
//!     │      └─> ContentEntry snapshots
//!     │
//!     └──> ProjectWatcher (debounced, polling fallback)
//!            └─> WatchEvent batches
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use codeprompt_indexer::{ContentCache, FileScanner, RefreshLimiter};
//! use codeprompt_protocol::NoFilter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scan = FileScanner::new("/path/to/project", 500).scan(&NoFilter)?;
//!     let cache = ContentCache::new("/path/to/project", 500_000, RefreshLimiter::default());
//!     cache.initialize(&scan.items);
//!     let files: Vec<String> = scan.files().map(str::to_string).collect();
//!     cache.refresh(&files).await?;
//!     Ok(())
//! }
//! ```

mod content_cache;
mod error;
mod limits;
mod scanner;
mod stats;
mod watcher;

pub use content_cache::{decode_text, mtime_nanos, ContentCache};
pub use error::{IndexerError, Result};
pub use limits::{
    parse_refresh_concurrency, refresh_concurrency_from_env, RefreshConcurrencySnapshot,
    RefreshLimiter, DEFAULT_REFRESH_CONCURRENCY, MAX_REFRESH_CONCURRENCY,
};
pub use scanner::{suggest_dense_directories, FileScanner, ScanResult};
pub use stats::CacheStatsSnapshot;
pub use watcher::{ProjectWatcher, WatchEvent, WatchMode, WatcherConfig};
