use crate::engine::{Engine, GenerationRequest};
use crate::error::GenerationResult;
use codeprompt_indexer::WatchEvent;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Background recompute of the current selection's prompt.
///
/// Requests are coalesced: only the most recent one is kept, and a burst of
/// requests made while a render runs yields a single follow-up render.
pub struct PrecomputeScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    engine: Arc<Engine>,
    latest: Mutex<Option<GenerationRequest>>,
    wake: Notify,
    completed_tx: watch::Sender<u64>,
}

impl PrecomputeScheduler {
    /// Spawn the loop. There should be one scheduler per engine.
    pub fn start(engine: Arc<Engine>) -> Self {
        let (completed_tx, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            engine,
            latest: Mutex::new(None),
            wake: Notify::new(),
            completed_tx,
        });
        let handle = tokio::spawn(run_loop(shared.clone()));
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Replace the pending request and wake the loop.
    pub fn request(&self, request: GenerationRequest) {
        *self
            .shared
            .latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(request);
        self.shared.wake.notify_one();
    }

    /// Request `base` with the active session's current selection, which a
    /// rescan may have pruned.
    pub fn request_current(&self, base: &GenerationRequest) -> GenerationResult<()> {
        let selection = self.shared.engine.active_session()?.selection();
        self.request(GenerationRequest {
            selection,
            ..base.clone()
        });
        Ok(())
    }

    /// Counter bumped after every finished recompute, successful or not.
    pub fn completions(&self) -> watch::Receiver<u64> {
        self.shared.completed_tx.subscribe()
    }

    /// Wait for the loop to exit after the engine's stop signal was raised.
    /// A render already in flight is allowed to finish.
    pub async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("Precompute loop ended abnormally: {err}");
            }
        }
    }
}

impl Drop for PrecomputeScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let mut stop = shared.engine.context().stop_signal();
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            () = shared.wake.notified() => {}
        }

        let request = shared
            .latest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(request) = request else {
            continue;
        };
        if let Err(err) = recompute(&shared.engine, &request).await {
            debug!("Precompute skipped: {err}");
        }
        shared.completed_tx.send_modify(|count| *count += 1);
    }
    debug!("Precompute loop stopped");
}

async fn recompute(engine: &Engine, request: &GenerationRequest) -> GenerationResult<()> {
    // The key is taken before the refresh so a concurrent edit can only
    // produce a miss later.
    let prepared = engine.prepare(request)?;
    if engine.artifacts().get(&prepared.key).is_some() {
        debug!("Precompute for {} already cached", prepared.key);
        return Ok(());
    }
    engine.metrics().record_precompute();
    let rendered = engine.render_prepared(&prepared, false).await?;
    if let Err(err) = engine
        .artifacts()
        .mirror(&prepared.key, &rendered.artifact.prompt)
    {
        warn!(
            "Cannot mirror prompt to {}: {err}",
            engine.artifacts().mirror_path().display()
        );
    }
    info!(
        "Precomputed {} files ({} chars)",
        prepared.selection.len(),
        rendered.artifact.total_selection_chars
    );
    Ok(())
}

/// Bring the active session up to date with a watcher event.
///
/// Structural events rescan the project; content events refresh the
/// affected known paths, or the whole selection when no paths are given.
/// Returns whether anything changed.
pub async fn apply_watch_event(engine: &Engine, event: &WatchEvent) -> GenerationResult<bool> {
    let session = engine.active_session()?;
    if event.structural {
        session.rescan().await?;
        return Ok(true);
    }
    let paths: Vec<String> = if event.paths.is_empty() {
        session.selection()
    } else {
        event
            .paths
            .iter()
            .filter(|path| session.cache().contains(path))
            .cloned()
            .collect()
    };
    if paths.is_empty() {
        return Ok(false);
    }
    Ok(session.cache().refresh(&paths).await?)
}

/// Rescan the active project after watch events were lost.
pub async fn resync(engine: &Engine) -> GenerationResult<bool> {
    engine.active_session()?.rescan().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::AppContext;
    use crate::session::ProjectSpec;
    use codeprompt_protocol::DEFAULT_TEMPLATE;
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn engine_for(root: &std::path::Path) -> Arc<Engine> {
        let mut templates = BTreeMap::new();
        templates.insert("Default".to_string(), DEFAULT_TEMPLATE.to_string());
        let engine = Arc::new(Engine::new(
            AppContext::new(),
            EngineConfig::default(),
            Arc::new(templates),
        ));
        engine
            .open_project(ProjectSpec::new("demo", root))
            .await
            .unwrap();
        engine
    }

    fn request(selection: &[&str]) -> GenerationRequest {
        GenerationRequest {
            selection: selection.iter().map(ToString::to_string).collect(),
            template: "Default".to_string(),
            ..GenerationRequest::default()
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<u64>, at_least: u64) {
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|n| *n >= at_least))
            .await
            .expect("precompute timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn precompute_fills_cache_and_mirror() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.py"), "x").unwrap();
        let engine = engine_for(temp.path()).await;
        let scheduler = PrecomputeScheduler::start(engine.clone());
        let mut done = scheduler.completions();

        scheduler.request(request(&["a.py"]));
        wait_for(&mut done, 1).await;

        let key = engine.prepare(&request(&["a.py"])).unwrap().key;
        let artifact = engine.artifacts().get(&key).unwrap();
        assert!(artifact.prompt.contains("--- a.py ---"));
        let mirrored = engine.artifacts().take_mirror(&key).unwrap();
        assert_eq!(fs::read_to_string(mirrored).unwrap(), artifact.prompt);

        engine.shutdown();
        scheduler.join().await;
    }

    #[tokio::test]
    async fn burst_of_requests_is_coalesced() {
        let temp = tempdir().unwrap();
        for name in ["a.py", "b.py", "c.py"] {
            fs::write(temp.path().join(name), name).unwrap();
        }
        let engine = engine_for(temp.path()).await;
        let scheduler = PrecomputeScheduler::start(engine.clone());
        let mut done = scheduler.completions();

        scheduler.request(request(&["a.py"]));
        scheduler.request(request(&["a.py", "b.py"]));
        scheduler.request(request(&["a.py", "b.py", "c.py"]));
        wait_for(&mut done, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let last = engine.prepare(&request(&["a.py", "b.py", "c.py"])).unwrap().key;
        assert!(engine.artifacts().get(&last).is_some());
        let first = engine.prepare(&request(&["a.py"])).unwrap().key;
        assert!(engine.artifacts().get(&first).is_none());
        assert_eq!(engine.metrics().snapshot().precompute_runs, 1);

        engine.shutdown();
        scheduler.join().await;
    }

    #[tokio::test]
    async fn stop_signal_ends_idle_loop() {
        let temp = tempdir().unwrap();
        let engine = engine_for(temp.path()).await;
        let scheduler = PrecomputeScheduler::start(engine.clone());
        engine.shutdown();
        tokio::time::timeout(Duration::from_secs(5), scheduler.join())
            .await
            .expect("loop did not stop");
    }

    #[tokio::test]
    async fn content_event_refreshes_known_paths() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.py"), "x").unwrap();
        let engine = engine_for(temp.path()).await;

        let event = WatchEvent {
            paths: vec!["a.py".to_string(), "unknown.py".to_string()],
            structural: false,
        };
        assert!(apply_watch_event(&engine, &event).await.unwrap());
        assert!(!apply_watch_event(&engine, &event).await.unwrap());

        fs::write(temp.path().join("new.py"), "n").unwrap();
        let structural = WatchEvent {
            paths: Vec::new(),
            structural: true,
        };
        assert!(apply_watch_event(&engine, &structural).await.unwrap());
        assert!(engine.active_session().unwrap().cache().contains("new.py"));
    }

    #[tokio::test]
    async fn resync_recomputes_the_pruned_selection() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.py"), "x").unwrap();
        fs::write(temp.path().join("b.py"), "y").unwrap();
        let engine = engine_for(temp.path()).await;
        let session = engine.active_session().unwrap();
        session.select(["a.py".to_string(), "b.py".to_string()].iter());
        let scheduler = PrecomputeScheduler::start(engine.clone());
        let mut done = scheduler.completions();

        fs::remove_file(temp.path().join("b.py")).unwrap();
        assert!(resync(&engine).await.unwrap());
        assert_eq!(session.selection(), vec!["a.py".to_string()]);

        scheduler.request_current(&request(&["a.py", "b.py"])).unwrap();
        wait_for(&mut done, 1).await;
        let key = engine.prepare(&request(&["a.py"])).unwrap().key;
        assert!(engine.artifacts().get(&key).is_some());

        engine.shutdown();
        scheduler.join().await;
    }
}
