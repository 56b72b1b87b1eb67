use crate::selection_key::SelectionKey;
use codeprompt_protocol::CachedArtifact;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

/// Rendered prompts by [`SelectionKey`].
///
/// Bounded by clearing everything once the capacity is exceeded. Stale
/// entries are never looked up again, so nothing else is evicted.
pub struct ArtifactCache {
    entries: Mutex<HashMap<SelectionKey, Arc<CachedArtifact>>>,
    capacity: usize,
    mirror: Mutex<Option<Mirror>>,
    mirror_path: PathBuf,
    expiry: Duration,
}

struct Mirror {
    key: SelectionKey,
    written_at: SystemTime,
}

impl ArtifactCache {
    pub fn new(capacity: usize, instance_id: &str, expiry: Duration) -> Self {
        Self::with_mirror_path(
            capacity,
            std::env::temp_dir().join(format!("codeprompt-{instance_id}.prompt.md")),
            expiry,
        )
    }

    pub fn with_mirror_path(capacity: usize, mirror_path: PathBuf, expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            mirror: Mutex::new(None),
            mirror_path,
            expiry,
        }
    }

    pub fn get(&self, key: &SelectionKey) -> Option<Arc<CachedArtifact>> {
        self.lock_entries().get(key).cloned()
    }

    pub fn insert(&self, key: SelectionKey, artifact: Arc<CachedArtifact>) {
        let mut entries = self.lock_entries();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            debug!("Artifact cache full ({} entries), clearing", entries.len());
            entries.clear();
        }
        entries.insert(key, artifact);
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    /// Write the prompt to the mirror file, replacing the previous one.
    pub fn mirror(&self, key: &SelectionKey, prompt: &str) -> std::io::Result<()> {
        let mut mirror = self.lock_mirror();
        std::fs::write(&self.mirror_path, prompt)?;
        *mirror = Some(Mirror {
            key: key.clone(),
            written_at: SystemTime::now(),
        });
        Ok(())
    }

    /// Hand over the mirror file if it holds `key` and has not expired.
    ///
    /// The caller owns the returned file and is expected to move it away.
    pub fn take_mirror(&self, key: &SelectionKey) -> Option<PathBuf> {
        let mut mirror = self.lock_mirror();
        let current = mirror.as_ref()?;
        if &current.key != key {
            return None;
        }
        let age = current.written_at.elapsed().unwrap_or_default();
        if age > self.expiry {
            debug!("Mirror for {key} expired after {age:?}");
            *mirror = None;
            self.remove_file();
            return None;
        }
        if !self.mirror_path.is_file() {
            *mirror = None;
            return None;
        }
        *mirror = None;
        Some(self.mirror_path.clone())
    }

    pub fn remove_mirror(&self) {
        let mut mirror = self.lock_mirror();
        *mirror = None;
        self.remove_file();
    }

    fn remove_file(&self) {
        match std::fs::remove_file(&self.mirror_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Cannot remove {}: {err}", self.mirror_path.display()),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<SelectionKey, Arc<CachedArtifact>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_mirror(&self) -> MutexGuard<'_, Option<Mirror>> {
        self.mirror
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
