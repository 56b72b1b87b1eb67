use crate::{IndexerError, Result};
use codeprompt_protocol::{InventoryItem, PathFilter};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Outcome of one inventory scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    pub items: Vec<InventoryItem>,
    /// Set when the file ceiling stopped the walk early.
    pub limit_exceeded: bool,
}

impl ScanResult {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|item| item.is_file())
            .map(|item| item.path.as_str())
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files().count()
    }
}

/// Scanner producing the ordered inventory of a project
pub struct FileScanner {
    root: PathBuf,
    max_files: usize,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>, max_files: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_files,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the project depth-first, files before subdirectories, each group
    /// in lexicographic order. Ignored directories are not descended into.
    pub fn scan(&self, filter: &dyn PathFilter) -> Result<ScanResult> {
        if !self.root.is_dir() {
            return Err(IndexerError::InvalidPath(self.root.display().to_string()));
        }

        let root = self.root.as_path();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by(|a, b| {
                a.file_type()
                    .is_dir()
                    .cmp(&b.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter()
            .filter_entry(|entry| Self::is_included(root, entry, filter));

        let mut result = ScanResult::default();
        let mut file_count = 0usize;

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable entry under {}: {err}", root.display());
                    continue;
                }
            };
            let Some(rel) = relative_posix(root, entry.path()) else {
                continue;
            };

            if entry.file_type().is_dir() {
                result.items.push(InventoryItem::dir(rel));
                continue;
            }
            if !is_regular_file(&entry) {
                continue;
            }
            if file_count >= self.max_files {
                result.limit_exceeded = true;
                break;
            }
            result.items.push(InventoryItem::file(rel));
            file_count += 1;
        }

        if result.limit_exceeded {
            warn!(
                "File limit of {} reached while scanning {}",
                self.max_files,
                root.display()
            );
        }
        info!("Found {file_count} files in {}", root.display());
        Ok(result)
    }

    fn is_included(root: &Path, entry: &DirEntry, filter: &dyn PathFilter) -> bool {
        let Some(rel) = relative_posix(root, entry.path()) else {
            return false;
        };
        let ignored = filter.should_ignore(&rel, entry.file_type().is_dir());
        if ignored {
            debug!("Ignoring {rel}");
        }
        !ignored
    }
}

/// Directories holding more than `threshold` non-ignored files directly.
///
/// Used to suggest deny-list additions for generated or vendored trees.
pub fn suggest_dense_directories(
    root: &Path,
    filter: &dyn PathFilter,
    threshold: usize,
) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(IndexerError::InvalidPath(root.display().to_string()));
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| FileScanner::is_included(root, entry, filter));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {err}", root.display());
                continue;
            }
        };
        if !is_regular_file(&entry) {
            continue;
        }
        let Some(rel) = relative_posix(root, entry.path()) else {
            continue;
        };
        if let Some((dir, _)) = rel.rsplit_once('/') {
            *counts.entry(dir.to_string()).or_insert(0) += 1;
        }
    }

    Ok(counts
        .into_iter()
        .filter(|(_, count)| *count > threshold)
        .map(|(dir, _)| dir)
        .collect())
}

fn is_regular_file(entry: &DirEntry) -> bool {
    let file_type = entry.file_type();
    file_type.is_file() || (file_type.is_symlink() && entry.path().is_file())
}

pub(crate) fn relative_posix(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut normalized = relative.to_string_lossy().to_string();
    if normalized.contains('\\') {
        normalized = normalized.replace('\\', "/");
    }
    (!normalized.is_empty()).then_some(normalized)
}
