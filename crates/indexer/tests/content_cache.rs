use codeprompt_indexer::{ContentCache, FileScanner, RefreshLimiter};
use codeprompt_protocol::{FileContent, NoFilter};
use pretty_assertions::assert_eq;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn write_with_mtime(path: &Path, content: &str, secs: u64) {
    fs::write(path, content).expect("write file");
    let file = File::options().write(true).open(path).expect("open file");
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .expect("set mtime");
}

fn loaded_text(cache: &ContentCache, path: &str) -> Arc<str> {
    match cache.entry(path).expect("entry").content {
        FileContent::Loaded(text) => text,
        other => panic!("{path} not loaded: {other:?}"),
    }
}

fn project() -> (TempDir, ContentCache, Vec<String>) {
    let temp = TempDir::new().expect("tempdir");
    write_with_mtime(&temp.path().join("a.py"), "alpha", 1_000);
    write_with_mtime(&temp.path().join("b.py"), "beta", 1_000);
    fs::create_dir_all(temp.path().join("sub")).expect("mkdir");
    write_with_mtime(&temp.path().join("sub").join("c.py"), "gamma", 1_000);

    let scan = FileScanner::new(temp.path(), 100)
        .scan(&NoFilter)
        .expect("scan");
    let cache = ContentCache::new(temp.path(), 1_000, RefreshLimiter::new(4));
    cache.initialize(&scan.items);
    let files = scan.files().map(str::to_string).collect();
    (temp, cache, files)
}

#[tokio::test]
async fn refresh_is_idempotent_without_disk_changes() {
    let (_temp, cache, files) = project();

    assert!(cache.refresh(&files).await.expect("first refresh"));
    let after_first = cache.stats();
    assert_eq!(after_first.files_read, 3);

    assert!(!cache.refresh(&files).await.expect("second refresh"));
    let after_second = cache.stats();
    assert_eq!(after_second.files_read, 3);
    assert_eq!(after_second.refresh_calls, 2);
}

#[tokio::test]
async fn mtime_change_rereads_only_that_path() {
    let (temp, cache, files) = project();
    cache.refresh(&files).await.expect("initial refresh");

    let a_before = loaded_text(&cache, "a.py");
    let c_before = loaded_text(&cache, "sub/c.py");

    write_with_mtime(&temp.path().join("b.py"), "beta v2", 2_000);
    assert!(cache.refresh(&files).await.expect("refresh after edit"));

    assert_eq!(cache.stats().files_read, 4);
    assert_eq!(&*loaded_text(&cache, "b.py"), "beta v2");
    assert_eq!(cache.entry("b.py").expect("entry").size, 7);
    assert!(Arc::ptr_eq(&a_before, &loaded_text(&cache, "a.py")));
    assert!(Arc::ptr_eq(&c_before, &loaded_text(&cache, "sub/c.py")));
}

#[tokio::test]
async fn oversized_files_track_byte_size_only() {
    let temp = TempDir::new().expect("tempdir");
    fs::write(temp.path().join("small.txt"), "tiny").expect("write small");
    fs::write(temp.path().join("huge.bin"), vec![b'x'; 4_096]).expect("write huge");

    let cache = ContentCache::new(temp.path(), 1_024, RefreshLimiter::new(2));
    let paths = vec!["huge.bin".to_string(), "small.txt".to_string()];
    cache.refresh(&paths).await.expect("refresh");

    let huge = cache.entry("huge.bin").expect("huge entry");
    assert_eq!(huge.content, FileContent::Oversized);
    assert_eq!(huge.size, 4_096);
    assert_eq!(&*loaded_text(&cache, "small.txt"), "tiny");
    assert_eq!(cache.total_size(&paths), 4_100);
}

#[tokio::test]
async fn deleted_file_is_dropped_from_both_maps() {
    let (temp, cache, files) = project();
    cache.refresh(&files).await.expect("initial refresh");

    fs::remove_file(temp.path().join("a.py")).expect("remove a.py");
    assert!(cache.refresh(&files).await.expect("refresh after delete"));

    assert!(cache.entry("a.py").is_none());
    assert!(!cache.contains("a.py"));
    assert_eq!(
        cache.known_files(),
        vec!["b.py".to_string(), "sub/c.py".to_string()]
    );
    assert_eq!(cache.stats().files_removed, 1);
    assert!(!cache.snapshot(&files).contains_key("a.py"));
}

#[tokio::test]
async fn line_endings_are_normalized_and_counted_as_chars() {
    let temp = TempDir::new().expect("tempdir");
    fs::write(temp.path().join("win.txt"), "a\r\nb\r\né\r\n").expect("write");

    let cache = ContentCache::new(temp.path(), 1_000, RefreshLimiter::new(1));
    let paths = vec!["win.txt".to_string()];
    cache.refresh(&paths).await.expect("refresh");

    let entry = cache.entry("win.txt").expect("entry");
    assert_eq!(entry.content, FileContent::Loaded(Arc::from("a\nb\né\n")));
    assert_eq!(entry.size, 6);
    assert_ne!(entry.mtime, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_agree_on_one_snapshot() {
    let (temp, cache, files) = project();
    let cache = Arc::new(cache);
    write_with_mtime(&temp.path().join("a.py"), "alpha v2", 3_000);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let files = files.clone();
        handles.push(tokio::spawn(async move { cache.refresh(&files).await }));
    }
    for handle in handles {
        handle.await.expect("join").expect("refresh");
    }

    let first = loaded_text(&cache, "a.py");
    assert_eq!(&*first, "alpha v2");
    assert!(!cache.refresh(&files).await.expect("settled refresh"));
    assert!(Arc::ptr_eq(&first, &loaded_text(&cache, "a.py")));
}
