use crate::scanner::relative_posix;
use crate::{IndexerError, Result};
use codeprompt_protocol::PathFilter;
use log::{debug, info, warn};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub max_batch_wait: Duration,
    /// Tick period of the polling fallback.
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(750),
            max_batch_wait: Duration::from_secs(3),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// A debounced batch of filesystem changes.
///
/// `structural` batches created, removed or renamed something and call for a
/// rescan. Otherwise only the contents of `paths` changed. An empty `paths`
/// with `structural == false` is a polling tick: refresh everything known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub paths: Vec<String>,
    pub structural: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Native,
    Polling,
}

#[derive(Clone)]
pub struct ProjectWatcher {
    inner: Arc<ProjectWatcherInner>,
}

struct ProjectWatcherInner {
    root: PathBuf,
    mode: WatchMode,
    command_tx: mpsc::Sender<WatcherCommand>,
    event_tx: broadcast::Sender<WatchEvent>,
    _watcher: Option<RecommendedWatcher>,
}

enum WatcherCommand {
    Trigger,
    Shutdown,
}

impl ProjectWatcher {
    /// Start watching `root`. Must be called inside a tokio runtime.
    pub fn start(
        root: impl AsRef<Path>,
        filter: Arc<dyn PathFilter>,
        config: WatcherConfig,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(IndexerError::InvalidPath(root.display().to_string()));
        }

        let (fs_tx, fs_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(64);

        let (watcher, mode) = match create_fs_watcher(&root, fs_tx) {
            Ok(watcher) => (Some(watcher), WatchMode::Native),
            Err(err) => {
                warn!(
                    "Native watcher unavailable for {} ({err}); polling every {:?}",
                    root.display(),
                    config.poll_interval
                );
                (None, WatchMode::Polling)
            }
        };
        info!("Watching {} ({mode:?})", root.display());

        spawn_watch_loop(
            root.clone(),
            filter,
            config,
            mode,
            fs_rx,
            command_rx,
            event_tx.clone(),
        );

        Ok(Self {
            inner: Arc::new(ProjectWatcherInner {
                root,
                mode,
                command_tx,
                event_tx,
                _watcher: watcher,
            }),
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Force a structural event without waiting for the debounce window.
    pub async fn trigger(&self) -> Result<()> {
        self.inner
            .command_tx
            .send(WatcherCommand::Trigger)
            .await
            .map_err(|e| IndexerError::Watcher(format!("failed to send trigger: {e}")))
    }

    #[must_use]
    pub fn mode(&self) -> WatchMode {
        self.inner.mode
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(WatcherCommand::Shutdown);
        }
    }
}

fn create_fs_watcher(
    root: &Path,
    sender: mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default(),
    )
    .map_err(|e| IndexerError::Watcher(format!("watcher init failed: {e}")))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| IndexerError::Watcher(format!("failed to watch {}: {e}", root.display())))?;
    Ok(watcher)
}

fn spawn_watch_loop(
    root: PathBuf,
    filter: Arc<dyn PathFilter>,
    config: WatcherConfig,
    mode: WatchMode,
    mut fs_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<WatcherCommand>,
    event_tx: broadcast::Sender<WatchEvent>,
) {
    tokio::spawn(async move {
        let mut state = DebounceState::new(config.debounce, config.max_batch_wait);
        let mut poll = time::interval_at(
            time::Instant::now() + config.poll_interval,
            config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_deadline = state.next_deadline();

            tokio::select! {
                Some(event) = fs_rx.recv() => {
                    handle_event(&root, filter.as_ref(), event, &mut state);
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(WatcherCommand::Trigger) => state.force_run(),
                        Some(WatcherCommand::Shutdown) | None => break,
                    }
                }
                _ = poll.tick(), if mode == WatchMode::Polling => {
                    publish(&event_tx, WatchEvent { paths: Vec::new(), structural: false });
                }
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if state.should_run() && next_deadline.is_some() => {
                    let event = state.take_event();
                    debug!(
                        "Watch batch for {}: {} paths, structural={}",
                        root.display(),
                        event.paths.len(),
                        event.structural
                    );
                    publish(&event_tx, event);
                    state.reset();
                }
            }
        }
        debug!("Watcher for {} stopped", root.display());
    });
}

fn publish(event_tx: &broadcast::Sender<WatchEvent>, event: WatchEvent) {
    if event_tx.send(event).is_err() {
        debug!("Watch event dropped: no subscribers");
    }
}

fn handle_event(
    root: &Path,
    filter: &dyn PathFilter,
    event: notify::Result<Event>,
    state: &mut DebounceState,
) -> bool {
    match event {
        Ok(evt) => {
            let Some(structural) = classify(&evt.kind) else {
                return false;
            };
            if evt.paths.is_empty() {
                state.record(Vec::new(), true);
                return true;
            }

            let relevant: Vec<String> = evt
                .paths
                .iter()
                .filter_map(|path| {
                    let rel = relative_posix(root, path)?;
                    (!filter.should_ignore(&rel, path.is_dir())).then_some(rel)
                })
                .collect();
            if relevant.is_empty() {
                return false;
            }
            state.record(relevant, structural);
            true
        }
        Err(err) => {
            warn!("Watcher error: {err}");
            false
        }
    }
}

/// `Some(true)` for tree-shape changes, `Some(false)` for content-only
/// changes, `None` for events that change nothing.
fn classify(kind: &EventKind) -> Option<bool> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_)) => Some(false),
        EventKind::Modify(ModifyKind::Name(_)) => Some(true),
        EventKind::Modify(_) => Some(false),
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Any | EventKind::Other => {
            Some(true)
        }
    }
}

struct DebounceState {
    debounce: Duration,
    max_batch: Duration,
    dirty: bool,
    structural: bool,
    force_immediate: bool,
    last_event: Option<Instant>,
    first_event: Option<Instant>,
    pending_paths: BTreeSet<String>,
}

impl DebounceState {
    fn new(debounce: Duration, max_batch: Duration) -> Self {
        Self {
            debounce,
            max_batch,
            dirty: false,
            structural: false,
            force_immediate: false,
            last_event: None,
            first_event: None,
            pending_paths: BTreeSet::new(),
        }
    }

    fn record(&mut self, paths: Vec<String>, structural: bool) {
        self.pending_paths.extend(paths);
        self.structural |= structural;
        self.last_event = Some(Instant::now());
        self.first_event.get_or_insert_with(Instant::now);
        self.dirty = true;
    }

    fn force_run(&mut self) {
        self.structural = true;
        self.force_immediate = true;
        self.dirty = true;
    }

    const fn should_run(&self) -> bool {
        self.dirty
    }

    fn next_deadline(&self) -> Option<time::Instant> {
        if !self.dirty {
            return None;
        }

        if self.force_immediate {
            return Some(time::Instant::now());
        }

        let mut deadline = self.last_event.map(|last| last + self.debounce);

        if let Some(first) = self.first_event {
            let forced = first + self.max_batch;
            deadline = Some(match deadline {
                Some(current) if forced < current => forced,
                Some(current) => current,
                None => forced,
            });
        }

        deadline.map(time::Instant::from_std)
    }

    fn take_event(&mut self) -> WatchEvent {
        WatchEvent {
            paths: std::mem::take(&mut self.pending_paths).into_iter().collect(),
            structural: self.structural,
        }
    }

    fn reset(&mut self) {
        self.dirty = false;
        self.structural = false;
        self.force_immediate = false;
        self.last_event = None;
        self.first_event = None;
        self.pending_paths.clear();
    }
}
