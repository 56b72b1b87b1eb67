use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod path_filters;

pub use path_filters::{FilterRules, NoFilter, PathFilter, RuleFilter};

pub const DIRS_TOKEN: &str = "{{dirs}}";
pub const FILES_PROVIDED_TOKEN: &str = "{{files_provided}}";
pub const FILE_CONTENTS_TOKEN: &str = "{{file_contents}}";
pub const CLIPBOARD_TOKEN: &str = "{{CLIPBOARD}}";

pub const DEFAULT_TEMPLATE_NAME: &str = "Default";
pub const DEFAULT_TEMPLATE: &str = "Your task is to\n\n{{dirs}}{{files_provided}}{{file_contents}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Dir,
}

/// One row of a project inventory scan.
///
/// Paths are posix-style and relative to the project root; directories carry
/// a trailing `/`. `level` is the number of `/` separators above the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub path: String,
    pub level: usize,
}

impl InventoryItem {
    #[must_use]
    pub fn file(path: impl Into<String>) -> Self {
        let path = path.into();
        let level = path.matches('/').count();
        Self {
            kind: ItemKind::File,
            path,
            level,
        }
    }

    #[must_use]
    pub fn dir(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        let level = path.trim_end_matches('/').matches('/').count();
        Self {
            kind: ItemKind::Dir,
            path,
            level,
        }
    }

    #[must_use]
    pub const fn is_file(&self) -> bool {
        matches!(self.kind, ItemKind::File)
    }
}

/// Cached state of a file's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum FileContent {
    /// Not loaded yet, or the last load failed.
    Pending,
    /// Larger than the per-file ceiling; only the size is tracked.
    Oversized,
    Loaded(Arc<str>),
}

impl FileContent {
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Snapshot of one cached file.
///
/// `size` is the character count for loaded text and the byte count for
/// oversized files. `mtime` is a nanosecond change token, `0` when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub path: String,
    pub content: FileContent,
    pub size: u64,
    pub mtime: u64,
}

/// Read access to file snapshots by relative path.
pub trait ContentLookup {
    fn entry(&self, path: &str) -> Option<&ContentEntry>;
}

impl<S: BuildHasher> ContentLookup for HashMap<String, ContentEntry, S> {
    fn entry(&self, path: &str) -> Option<&ContentEntry> {
        self.get(path)
    }
}

impl ContentLookup for BTreeMap<String, ContentEntry> {
    fn entry(&self, path: &str) -> Option<&ContentEntry> {
        self.get(path)
    }
}

/// A rendered prompt plus its omission report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub prompt: String,
    pub total_selection_chars: u64,
    #[serde(default)]
    pub oversized_files: Vec<String>,
    #[serde(default)]
    pub truncated_files: Vec<String>,
}

impl CachedArtifact {
    #[must_use]
    pub fn has_omissions(&self) -> bool {
        !self.oversized_files.is_empty() || !self.truncated_files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_files: usize,
    pub max_file_size: u64,
    pub max_content_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_files: 500,
            max_file_size: 500_000,
            max_content_size: 2_000_000,
        }
    }
}

#[must_use]
pub fn uses_clipboard(template: &str) -> bool {
    template.contains(CLIPBOARD_TOKEN)
}

/// Clipboard-only templates transform clipboard text and never embed files.
#[must_use]
pub fn is_clipboard_only(template: &str) -> bool {
    uses_clipboard(template) && !template.contains(FILE_CONTENTS_TOKEN)
}

pub trait TemplateProvider: Send + Sync {
    fn template_content(&self, name: &str) -> Option<String>;

    fn is_clipboard_template(&self, name: &str) -> bool {
        self.template_content(name)
            .is_some_and(|content| is_clipboard_only(&content))
    }
}

impl TemplateProvider for BTreeMap<String, String> {
    fn template_content(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Destination for finished prompts.
pub trait OutputSink: Send + Sync {
    fn save(
        &self,
        content: &str,
        project: &str,
        source_template: &str,
        selection: &[String],
    ) -> Result<PathBuf>;

    /// Save a prompt that was already staged on disk.
    fn save_from_file(
        &self,
        staged: &Path,
        project: &str,
        source_template: &str,
        selection: &[String],
    ) -> Result<PathBuf> {
        let content = std::fs::read_to_string(staged)?;
        let saved = self.save(&content, project, source_template, selection)?;
        if let Err(err) = std::fs::remove_file(staged) {
            log::debug!("Leaving staged prompt {}: {err}", staged.display());
        }
        Ok(saved)
    }
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}
