use codeprompt_indexer::{ProjectWatcher, WatchEvent, WatchMode, WatcherConfig};
use codeprompt_protocol::{NoFilter, RuleFilter};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;

fn fast_config() -> WatcherConfig {
    WatcherConfig {
        debounce: Duration::from_millis(150),
        max_batch_wait: Duration::from_secs(1),
        poll_interval: Duration::from_millis(200),
    }
}

async fn wait_for(
    events: &mut Receiver<WatchEvent>,
    timeout: Duration,
    mut accept: impl FnMut(&WatchEvent) -> bool,
) -> Option<WatchEvent> {
    tokio::time::timeout(timeout, async {
        loop {
            if let Ok(event) = events.recv().await {
                if accept(&event) {
                    break Some(event);
                }
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_change_is_batched_and_reported() {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    let file_path = temp.path().join("lib.rs");
    tokio::fs::write(&file_path, "fn noop() {}\n")
        .await
        .expect("write initial file");

    let watcher = ProjectWatcher::start(temp.path(), Arc::new(NoFilter), fast_config())
        .expect("start watcher");
    if watcher.mode() == WatchMode::Polling {
        eprintln!("skipping: native watcher unavailable");
        return;
    }
    let mut events = watcher.subscribe();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for idx in 0..5 {
        tokio::fs::write(&file_path, format!("fn updated_{idx}() {{}}\n"))
            .await
            .expect("update file");
    }

    let event = wait_for(&mut events, Duration::from_secs(4), |event| {
        event.paths.iter().any(|p| p == "lib.rs")
    })
    .await
    .expect("watch event for lib.rs");
    assert_eq!(event.paths, vec!["lib.rs".to_string()]);
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "watcher latency test is only reliable on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_files_are_structural_and_filtered() {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping watch_flow due to SKIP_WATCH_FLOW");
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("build")).expect("create build");

    let filter = RuleFilter::from_patterns(&["build".to_string()], &[]);
    let watcher = ProjectWatcher::start(temp.path(), Arc::new(filter), fast_config())
        .expect("start watcher");
    if watcher.mode() == WatchMode::Polling {
        eprintln!("skipping: native watcher unavailable");
        return;
    }
    let mut events = watcher.subscribe();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::fs::write(temp.path().join("build").join("out.o"), "bin")
        .await
        .expect("write ignored");
    tokio::fs::write(temp.path().join("main.rs"), "fn main() {}\n")
        .await
        .expect("write new file");

    let event = wait_for(&mut events, Duration::from_secs(4), |event| {
        event.paths.iter().any(|p| p == "main.rs")
    })
    .await
    .expect("watch event for main.rs");
    assert!(event.structural);
    assert!(event.paths.iter().all(|p| !p.starts_with("build")));
}

#[tokio::test]
async fn manual_trigger_emits_structural_event() {
    let temp = TempDir::new().expect("tempdir");
    let watcher = ProjectWatcher::start(temp.path(), Arc::new(NoFilter), fast_config())
        .expect("start watcher");
    let mut events = watcher.subscribe();

    watcher.trigger().await.expect("trigger");
    let event = wait_for(&mut events, Duration::from_secs(2), |event| event.structural)
        .await
        .expect("structural event");
    assert!(event.structural);
}

#[tokio::test]
async fn missing_root_is_rejected() {
    let temp = TempDir::new().expect("tempdir");
    let result = ProjectWatcher::start(
        temp.path().join("missing"),
        Arc::new(NoFilter),
        WatcherConfig::default(),
    );
    assert!(result.is_err());
}
