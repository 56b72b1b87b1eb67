use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// State shared by every component of one application session.
pub struct AppContext {
    instance_id: String,
    known_writes: Mutex<HashMap<PathBuf, SystemTime>>,
    stop_tx: watch::Sender<bool>,
}

impl AppContext {
    pub fn new() -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            instance_id: generate_instance_id(),
            known_writes: Mutex::new(HashMap::new()),
            stop_tx,
        })
    }

    /// `<pid>-<6 base36 chars>`, unique per process start.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Remember the mtime of a file this instance wrote or loaded.
    pub fn record_own_write(&self, path: &Path, mtime: SystemTime) {
        self.writes().insert(path.to_path_buf(), mtime);
    }

    pub fn last_own_write(&self, path: &Path) -> Option<SystemTime> {
        self.writes().get(path).copied()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn writes(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, SystemTime>> {
        self.known_writes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn generate_instance_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());

    let mut hasher = blake3::Hasher::new();
    hasher.update(&pid.to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();

    let suffix: String = digest.as_bytes()[..6]
        .iter()
        .map(|byte| char::from(BASE36[usize::from(*byte) % BASE36.len()]))
        .collect();
    format!("{pid}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_have_pid_and_suffix() {
        let first = AppContext::new();
        let second = AppContext::new();
        let (pid, suffix) = first.instance_id().split_once('-').unwrap();
        assert_eq!(pid, std::process::id().to_string());
        assert_eq!(suffix.len(), 6);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
        assert_ne!(first.instance_id(), second.instance_id());
    }

    #[test]
    fn stop_signal_is_observable() {
        let ctx = AppContext::new();
        let rx = ctx.stop_signal();
        assert!(!ctx.is_stopping());
        ctx.request_stop();
        assert!(ctx.is_stopping());
        assert!(*rx.borrow());
    }

    #[test]
    fn own_writes_are_tracked_per_path() {
        let ctx = AppContext::new();
        let path = Path::new("/tmp/settings.json");
        assert!(ctx.last_own_write(path).is_none());
        let stamp = UNIX_EPOCH + std::time::Duration::from_secs(5);
        ctx.record_own_write(path, stamp);
        assert_eq!(ctx.last_own_write(path), Some(stamp));
    }
}
