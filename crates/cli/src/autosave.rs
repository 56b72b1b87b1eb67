use crate::store::SettingsStore;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Save dirty settings every `interval` until `stop` fires, then save once
/// more. Saves run on the blocking pool.
pub fn spawn_autosave(
    store: Arc<SettingsStore>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => save_now(&store).await,
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        save_now(&store).await;
        debug!("Autosave stopped");
    })
}

async fn save_now(store: &Arc<SettingsStore>) {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.save_if_dirty()).await {
        Ok(Ok(true)) => debug!("Autosaved settings"),
        Ok(Ok(false)) => {}
        Ok(Err(err)) => warn!("Autosave failed: {err:#}"),
        Err(err) => warn!("Autosave task failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AppContext;
    use crate::store::{ProjectRecord, SETTINGS_FILE_NAME};
    use tempfile::tempdir;

    #[tokio::test]
    async fn saves_periodically_and_on_stop() {
        let temp = tempdir().unwrap();
        let context = AppContext::new();
        let path = temp.path().join(SETTINGS_FILE_NAME);
        let store = Arc::new(SettingsStore::open(&path, context.clone()).unwrap());
        let handle = spawn_autosave(
            store.clone(),
            Duration::from_millis(20),
            context.stop_signal(),
        );

        store.upsert_project("first", ProjectRecord::default());
        time::timeout(Duration::from_secs(5), async {
            while store.is_dirty() || !path.exists() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("periodic save did not happen");
        assert!(path.exists());

        store.upsert_project("second", ProjectRecord::default());
        context.request_stop();
        time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("autosave did not stop")
            .unwrap();
        assert!(!store.is_dirty());
        let reopened = SettingsStore::open(&path, AppContext::new()).unwrap();
        assert!(reopened.project("second").is_some());
    }
}
