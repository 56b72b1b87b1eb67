use anyhow::{Context, Result};
use fs2::FileExt;
use log::debug;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static STORE_LOCK_WAIT_MS_MAX: AtomicU64 = AtomicU64::new(0);

/// Longest time any instance in this process waited for a store lock.
pub fn store_lock_wait_ms_max() -> u64 {
    STORE_LOCK_WAIT_MS_MAX.load(Ordering::Relaxed)
}

/// Advisory cross-process lock on `<file>.lock`, released on drop.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Block until the lock for `target` is held.
    pub fn acquire(target: &Path) -> Result<Self> {
        let path = lock_path_for(target);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Cannot open store lock {}", path.display()))?;

        let start = Instant::now();
        file.lock_exclusive()
            .with_context(|| format!("Cannot acquire store lock {}", path.display()))?;
        let waited = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        STORE_LOCK_WAIT_MS_MAX.fetch_max(waited, Ordering::Relaxed);
        if waited > 0 {
            debug!("Waited {waited}ms for {}", path.display());
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn lock_file_sits_next_to_target() {
        assert_eq!(
            lock_path_for(Path::new("/data/settings.json")),
            PathBuf::from("/data/settings.json.lock")
        );
    }

    #[test]
    fn second_holder_waits_for_release() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("settings.json");
        let first = StoreLock::acquire(&target).unwrap();
        assert!(first.path().exists());

        let (tx, rx) = mpsc::channel();
        let waiter_target = target.clone();
        let waiter = std::thread::spawn(move || {
            let _second = StoreLock::acquire(&waiter_target).unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
