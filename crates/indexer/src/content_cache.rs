use crate::limits::RefreshLimiter;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::{IndexerError, Result};
use codeprompt_protocol::{ContentEntry, FileContent, InventoryItem};
use log::{debug, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;
use tokio::task::JoinSet;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FileMeta {
    size: u64,
    mtime: u64,
}

#[derive(Default)]
struct CacheState {
    meta: HashMap<String, FileMeta>,
    contents: HashMap<String, FileContent>,
    /// Read ticket of the load that produced each cached content.
    tickets: HashMap<String, u64>,
}

enum StatOutcome {
    Present(FileMeta),
    Missing,
    Failed(io::Error),
}

struct Loaded {
    path: String,
    content: FileContent,
    meta: FileMeta,
    ticket: u64,
}

/// Per-project cache of file text keyed by relative path.
///
/// Metadata and content live in two maps behind one lock. The lock is held
/// only to compare and to write back; disk reads run outside it, in parallel,
/// bounded by the [`RefreshLimiter`]. Every read draws a ticket just before
/// touching the disk; a write-back never replaces content read later.
pub struct ContentCache {
    root: PathBuf,
    max_file_size: u64,
    state: Mutex<CacheState>,
    limiter: RefreshLimiter,
    stats: CacheStats,
    next_ticket: Arc<AtomicU64>,
}

impl ContentCache {
    pub fn new(root: impl AsRef<Path>, max_file_size: u64, limiter: RefreshLimiter) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_file_size,
            state: Mutex::new(CacheState::default()),
            limiter,
            stats: CacheStats::default(),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace all entries with unloaded placeholders for the inventory's files.
    pub fn initialize(&self, items: &[InventoryItem]) {
        let mut state = self.lock();
        state.meta.clear();
        state.contents.clear();
        state.tickets.clear();
        for item in items.iter().filter(|item| item.is_file()) {
            state.meta.insert(item.path.clone(), FileMeta::default());
            state.contents.insert(item.path.clone(), FileContent::Pending);
        }
        debug!(
            "Content cache for {} reset with {} placeholders",
            self.root.display(),
            state.meta.len()
        );
    }

    /// Bring `paths` up to date with the disk.
    ///
    /// Returns `true` when at least one file was re-read or a vanished entry
    /// was dropped.
    pub async fn refresh(&self, paths: &[String]) -> Result<bool> {
        self.stats.record_refresh();
        if paths.is_empty() {
            return Ok(false);
        }

        let stats = self.stat_all(paths).await?;

        let mut removed = 0usize;
        let mut dirty = Vec::new();
        {
            let mut state = self.lock();
            for (path, outcome) in stats {
                match outcome {
                    StatOutcome::Missing => {
                        let had_meta = state.meta.remove(&path).is_some();
                        let had_content = state.contents.remove(&path).is_some();
                        state.tickets.remove(&path);
                        if had_meta || had_content {
                            debug!("Dropping vanished file {path}");
                            removed += 1;
                        }
                    }
                    StatOutcome::Failed(err) => {
                        warn!("Failed to stat {path}: {err}");
                        state.meta.insert(path.clone(), FileMeta::default());
                        state.contents.insert(path, FileContent::Pending);
                    }
                    StatOutcome::Present(meta) => {
                        let clean = state
                            .meta
                            .get(&path)
                            .is_some_and(|cached| cached.mtime != 0 && cached.mtime == meta.mtime)
                            && state.contents.get(&path).is_some_and(|c| !c.is_pending());
                        if !clean {
                            dirty.push((path, meta));
                        }
                    }
                }
            }
        }
        self.stats.record_removed(removed);

        if dirty.is_empty() {
            return Ok(removed > 0);
        }

        let loaded = self.load_all(dirty).await;
        let reread = loaded.len();
        self.stats.record_reads(reread);
        self.store_loaded(loaded);

        debug!(
            "Refreshed {} of {} paths under {} ({removed} removed)",
            reread,
            paths.len(),
            self.root.display()
        );
        Ok(reread > 0 || removed > 0)
    }

    fn store_loaded(&self, loaded: Vec<Loaded>) {
        let mut state = self.lock();
        for entry in loaded {
            let superseded = state
                .tickets
                .get(&entry.path)
                .is_some_and(|stored| *stored > entry.ticket);
            if superseded {
                debug!("Discarding stale read of {}", entry.path);
                continue;
            }
            state.tickets.insert(entry.path.clone(), entry.ticket);
            state.meta.insert(entry.path.clone(), entry.meta);
            state.contents.insert(entry.path, entry.content);
        }
    }

    async fn stat_all(&self, paths: &[String]) -> Result<Vec<(String, StatOutcome)>> {
        let root = self.root.clone();
        let paths = paths.to_vec();
        tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|path| {
                    let outcome = stat_file(&root.join(&path));
                    (path, outcome)
                })
                .collect()
        })
        .await
        .map_err(|err| IndexerError::Other(format!("stat task failed: {err}")))
    }

    async fn load_all(&self, dirty: Vec<(String, FileMeta)>) -> Vec<Loaded> {
        let mut tasks = JoinSet::new();
        for (path, meta) in dirty {
            let limiter = self.limiter.clone();
            let abs = self.root.join(&path);
            let max_file_size = self.max_file_size;
            let next_ticket = self.next_ticket.clone();
            tasks.spawn(async move {
                let _permit = limiter.acquire().await;
                let ticket = next_ticket.fetch_add(1, Ordering::Relaxed);
                let read = tokio::task::spawn_blocking(move || {
                    load_file(&abs, meta.size, max_file_size)
                })
                .await;
                (path, meta, ticket, read)
            });
        }

        let mut loaded = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (path, meta, ticket, read) = match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!("Content load task failed: {err}");
                    continue;
                }
            };
            let (content, size) = match read {
                Ok(Ok(loaded)) => loaded,
                Ok(Err(err)) => {
                    warn!("Failed to read {path}: {err}");
                    self.stats.record_read_failure();
                    (FileContent::Loaded(Arc::from("")), 0)
                }
                Err(err) => {
                    warn!("Read task for {path} failed: {err}");
                    self.stats.record_read_failure();
                    (FileContent::Loaded(Arc::from("")), 0)
                }
            };
            loaded.push(Loaded {
                path,
                content,
                meta: FileMeta {
                    size,
                    mtime: meta.mtime,
                },
                ticket,
            });
        }
        loaded
    }

    /// Snapshot of a single entry.
    pub fn entry(&self, path: &str) -> Option<ContentEntry> {
        let state = self.lock();
        Self::entry_locked(&state, path)
    }

    /// Snapshot of the requested entries; unknown paths are left out.
    pub fn snapshot(&self, paths: &[String]) -> HashMap<String, ContentEntry> {
        let state = self.lock();
        paths
            .iter()
            .filter_map(|path| Self::entry_locked(&state, path).map(|e| (path.clone(), e)))
            .collect()
    }

    fn entry_locked(state: &CacheState, path: &str) -> Option<ContentEntry> {
        let content = state.contents.get(path)?.clone();
        let meta = state.meta.get(path).copied().unwrap_or_default();
        Some(ContentEntry {
            path: path.to_string(),
            content,
            size: meta.size,
            mtime: meta.mtime,
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().contents.contains_key(path)
    }

    pub fn known_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.lock().contents.keys().cloned().collect();
        files.sort();
        files
    }

    /// Sum of last known sizes for `paths`.
    pub fn total_size(&self, paths: &[String]) -> u64 {
        let state = self.lock();
        paths
            .iter()
            .filter_map(|path| state.meta.get(path))
            .map(|meta| meta.size)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.lock().contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn stat_file(path: &Path) -> StatOutcome {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => StatOutcome::Present(FileMeta {
            size: metadata.len(),
            mtime: mtime_nanos(&metadata),
        }),
        Ok(_) => StatOutcome::Missing,
        Err(err) if err.kind() == io::ErrorKind::NotFound => StatOutcome::Missing,
        Err(err) => StatOutcome::Failed(err),
    }
}

/// Modification time as nanoseconds since the epoch, `0` when unavailable.
pub fn mtime_nanos(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |duration| {
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
        })
}

fn load_file(path: &Path, size: u64, max_file_size: u64) -> io::Result<(FileContent, u64)> {
    if size > max_file_size {
        debug!(
            "Skipping content of {} ({size} bytes > {max_file_size})",
            path.display()
        );
        return Ok((FileContent::Oversized, size));
    }
    let bytes = std::fs::read(path)?;
    let text = decode_text(&bytes);
    let chars = text.chars().count() as u64;
    Ok((FileContent::Loaded(Arc::from(text)), chars))
}

/// Lossy UTF-8 decode with BOM removal and `\n` line endings.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = String::from_utf8_lossy(bytes);
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_strips_bom_and_unifies_newlines() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFa\r\nb\rc\n"), "a\nb\nc\n");
        assert_eq!(decode_text(b"plain"), "plain");
        assert_eq!(decode_text(b"bad \xFF byte"), "bad \u{FFFD} byte");
    }

    #[test]
    fn initialize_is_a_full_reset() {
        let cache = ContentCache::new("/nonexistent", 10, RefreshLimiter::new(1));
        cache.initialize(&[InventoryItem::file("a.py"), InventoryItem::dir("sub")]);
        assert_eq!(cache.known_files(), vec!["a.py".to_string()]);

        cache.initialize(&[InventoryItem::file("b.py")]);
        assert_eq!(cache.known_files(), vec!["b.py".to_string()]);
        let entry = cache.entry("b.py").unwrap();
        assert_eq!(entry.content, FileContent::Pending);
        assert_eq!(entry.size, 0);
    }

    fn pin_mtime(path: &Path, secs: u64) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn late_write_back_of_an_earlier_read_is_discarded() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("a.py");
        std::fs::write(&file, "new").unwrap();
        pin_mtime(&file, 2_000);

        let cache = ContentCache::new(temp.path(), 1_000, RefreshLimiter::new(2));
        cache.initialize(&[InventoryItem::file("a.py")]);
        assert!(cache.refresh(&["a.py".to_string()]).await.unwrap());

        // A read that drew its ticket before the refresh above, finishing last.
        cache.store_loaded(vec![Loaded {
            path: "a.py".to_string(),
            content: FileContent::Loaded(Arc::from("old")),
            meta: FileMeta {
                size: 3,
                mtime: 1_000 * 1_000_000_000,
            },
            ticket: 0,
        }]);

        let entry = cache.entry("a.py").unwrap();
        assert_eq!(entry.content, FileContent::Loaded(Arc::from("new")));
        assert_eq!(entry.mtime, 2_000 * 1_000_000_000);
    }

    #[tokio::test]
    async fn mtime_moving_backwards_still_reloads() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("a.py");
        std::fs::write(&file, "first").unwrap();
        pin_mtime(&file, 2_000);

        let cache = ContentCache::new(temp.path(), 1_000, RefreshLimiter::new(2));
        cache.initialize(&[InventoryItem::file("a.py")]);
        cache.refresh(&["a.py".to_string()]).await.unwrap();

        std::fs::write(&file, "restored").unwrap();
        pin_mtime(&file, 1_000);
        assert!(cache.refresh(&["a.py".to_string()]).await.unwrap());

        let entry = cache.entry("a.py").unwrap();
        assert_eq!(entry.content, FileContent::Loaded(Arc::from("restored")));
        assert_eq!(entry.mtime, 1_000 * 1_000_000_000);
    }
}
