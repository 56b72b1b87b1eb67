use crate::context::AppContext;
use crate::session::ProjectSpec;
use crate::store_lock::StoreLock;
use anyhow::{Context, Result};
use codeprompt_protocol::{FilterRules, TemplateProvider, DEFAULT_TEMPLATE, DEFAULT_TEMPLATE_NAME};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SETTINGS_FILE_NAME: &str = "settings.json";
/// Prior versions kept as `<file>.bak1` (newest) .. `<file>.bakN`.
pub const BACKUP_COUNT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub templates: BTreeMap<String, String>,
    pub global_blacklist: Vec<String>,
    pub global_keep: Vec<String>,
    pub respect_gitignore: bool,
    pub projects: BTreeMap<String, ProjectRecord>,
    /// Generated selections, newest first.
    pub history: Vec<HistoryEntry>,
    pub quick_action_usage: BTreeMap<String, QuickActionUsage>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(DEFAULT_TEMPLATE_NAME.to_string(), DEFAULT_TEMPLATE.to_string());
        Self {
            templates,
            global_blacklist: Vec::new(),
            global_keep: Vec::new(),
            respect_gitignore: true,
            projects: BTreeMap::new(),
            history: Vec::new(),
            quick_action_usage: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectRecord {
    pub path: PathBuf,
    pub blacklist: Vec<String>,
    pub keep: Vec<String>,
    pub prefix: String,
    pub last_files: Vec<String>,
    pub last_template: Option<String>,
    pub usage_count: u64,
    /// Unix seconds of the last generation.
    pub last_usage: u64,
}

/// One distinct file set generated for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    /// Sorted and deduplicated.
    pub files: Vec<String>,
    pub project: String,
    /// Number of generations of this file set.
    pub gens: u64,
    pub char_size: u64,
    pub source_name: Option<String>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickActionUsage {
    pub count: u64,
    pub last_used_ms: u64,
}

/// Stable id of a file set: order and duplicates do not matter.
pub fn selection_id(files: &[String]) -> String {
    let set = file_set(files);
    let hash = blake3::hash(set.join(",").as_bytes());
    hash.to_hex()[..16].to_string()
}

fn file_set(files: &[String]) -> Vec<String> {
    let mut set = files.to_vec();
    set.sort();
    set.dedup();
    set
}

struct StoreState {
    settings: Settings,
    dirty: bool,
}

/// `settings.json` with rotating backups and external-change detection.
pub struct SettingsStore {
    path: PathBuf,
    context: Arc<AppContext>,
    state: Mutex<StoreState>,
    save_guard: Mutex<()>,
}

impl SettingsStore {
    /// Load `path`; a missing file yields defaults, a corrupt one is set
    /// aside as `<file>.corrupt.<unix>` and replaced by defaults.
    pub fn open(path: impl Into<PathBuf>, context: Arc<AppContext>) -> Result<Self> {
        let path = path.into();
        let (settings, dirty) = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Settings>(&raw) {
                Ok(settings) => {
                    remember_mtime(&context, &path);
                    (settings, false)
                }
                Err(err) => {
                    let aside = corrupt_path_for(&path);
                    warn!(
                        "{} is corrupt ({err}); moving it to {}",
                        path.display(),
                        aside.display()
                    );
                    fs::copy(&path, &aside)
                        .with_context(|| format!("Cannot back up {}", path.display()))?;
                    (Settings::default(), true)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, starting fresh", path.display());
                (Settings::default(), false)
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Cannot read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            context,
            state: Mutex::new(StoreState { settings, dirty }),
            save_guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    /// Mutate the settings and mark them for saving.
    pub fn update<R>(&self, apply: impl FnOnce(&mut Settings) -> R) -> R {
        let mut state = self.lock();
        state.dirty = true;
        apply(&mut state.settings)
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn save(&self) -> Result<()> {
        let _guard = self
            .save_guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let snapshot = {
            let mut state = self.lock();
            state.dirty = false;
            state.settings.clone()
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        if let Err(err) = write_with_backups(&self.path, &bytes, self.context.instance_id()) {
            self.lock().dirty = true;
            return Err(err);
        }
        remember_mtime(&self.context, &self.path);
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    pub fn save_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// True when the file on disk was written by someone else since this
    /// instance last loaded or saved it.
    pub fn changed_externally(&self) -> bool {
        let Ok(mtime) = fs::metadata(&self.path).and_then(|meta| meta.modified()) else {
            return false;
        };
        self.context
            .last_own_write(&self.path)
            .map_or(true, |own| own != mtime)
    }

    /// Re-read the file, dropping unsaved changes.
    pub fn reload(&self) -> Result<()> {
        let raw = fs::read(&self.path)
            .with_context(|| format!("Cannot read {}", self.path.display()))?;
        let settings: Settings = serde_json::from_slice(&raw)
            .with_context(|| format!("Cannot parse {}", self.path.display()))?;
        *self.lock() = StoreState {
            settings,
            dirty: false,
        };
        remember_mtime(&self.context, &self.path);
        info!("Reloaded settings from {}", self.path.display());
        Ok(())
    }

    pub fn project(&self, name: &str) -> Option<ProjectRecord> {
        self.lock().settings.projects.get(name).cloned()
    }

    pub fn upsert_project(&self, name: &str, record: ProjectRecord) {
        self.update(|settings| {
            settings.projects.insert(name.to_string(), record);
        });
    }

    pub fn remove_project(&self, name: &str) -> bool {
        self.update(|settings| settings.projects.remove(name).is_some())
    }

    /// Remember what was generated, for the next session.
    pub fn record_usage(&self, name: &str, files: &[String], template: &str) {
        self.update(|settings| {
            if let Some(record) = settings.projects.get_mut(name) {
                record.last_files = files.to_vec();
                record.last_template = Some(template.to_string());
                record.usage_count += 1;
                record.last_usage = unix_now();
            }
        });
    }

    /// Record a generated selection. Generating the same file set again for
    /// the same project bumps `gens` and moves the entry to the front.
    pub fn add_history(
        &self,
        project: &str,
        files: &[String],
        char_size: u64,
        source: Option<&str>,
    ) {
        self.add_history_at(project, files, char_size, source, unix_now_ms());
    }

    fn add_history_at(
        &self,
        project: &str,
        files: &[String],
        char_size: u64,
        source: Option<&str>,
        now_ms: u64,
    ) {
        let id = selection_id(files);
        self.update(|settings| {
            let history = &mut settings.history;
            let mut entry = match history
                .iter()
                .position(|entry| entry.id == id && entry.project == project)
            {
                Some(index) => {
                    let mut entry = history.remove(index);
                    entry.gens += 1;
                    entry
                }
                None => HistoryEntry {
                    id,
                    files: file_set(files),
                    project: project.to_string(),
                    gens: 1,
                    char_size: 0,
                    source_name: None,
                    timestamp_ms: 0,
                },
            };
            entry.char_size = char_size;
            entry.source_name = source.map(str::to_string);
            entry.timestamp_ms = now_ms;
            history.insert(0, entry);
            history.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        });
    }

    /// History entries, newest first, optionally for one project.
    pub fn history(&self, project: Option<&str>) -> Vec<HistoryEntry> {
        self.lock()
            .settings
            .history
            .iter()
            .filter(|entry| project.map_or(true, |name| entry.project == name))
            .cloned()
            .collect()
    }

    pub fn history_entry(&self, project: &str, id: &str) -> Option<HistoryEntry> {
        self.lock()
            .settings
            .history
            .iter()
            .find(|entry| entry.project == project && entry.id == id)
            .cloned()
    }

    pub fn record_quick_action_usage(&self, name: &str) {
        self.record_quick_action_usage_at(name, unix_now_ms());
    }

    fn record_quick_action_usage_at(&self, name: &str, now_ms: u64) {
        self.update(|settings| {
            let usage = settings
                .quick_action_usage
                .entry(name.to_string())
                .or_default();
            usage.count += 1;
            usage.last_used_ms = now_ms;
        });
    }

    /// Quick actions by use count, ties broken by the most recent use.
    pub fn quick_action_ranking(&self) -> Vec<(String, QuickActionUsage)> {
        let mut ranking: Vec<_> = self
            .lock()
            .settings
            .quick_action_usage
            .iter()
            .map(|(name, usage)| (name.clone(), *usage))
            .collect();
        ranking.sort_by(|(a_name, a), (b_name, b)| {
            b.count
                .cmp(&a.count)
                .then(b.last_used_ms.cmp(&a.last_used_ms))
                .then(a_name.cmp(b_name))
        });
        ranking
    }

    pub fn most_used_quick_action(&self) -> Option<String> {
        self.quick_action_ranking()
            .into_iter()
            .next()
            .map(|(name, _)| name)
    }

    pub fn last_used_quick_action(&self) -> Option<String> {
        self.lock()
            .settings
            .quick_action_usage
            .iter()
            .max_by(|(a_name, a), (b_name, b)| {
                a.last_used_ms
                    .cmp(&b.last_used_ms)
                    .then(b_name.cmp(a_name))
            })
            .map(|(name, _)| name.clone())
    }

    /// Engine view of a stored project, with global lists merged in.
    pub fn project_spec(&self, name: &str) -> Option<ProjectSpec> {
        let state = self.lock();
        let settings = &state.settings;
        let record = settings.projects.get(name)?;
        let own = FilterRules {
            respect_gitignore: settings.respect_gitignore,
            deny: record.blacklist.clone(),
            keep: record.keep.clone(),
        };
        Some(ProjectSpec {
            name: name.to_string(),
            root: record.path.clone(),
            rules: FilterRules::merged(&own, &settings.global_blacklist, &settings.global_keep),
            prefix: record.prefix.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TemplateProvider for SettingsStore {
    fn template_content(&self, name: &str) -> Option<String> {
        self.lock().settings.templates.get(name).cloned()
    }
}

/// Replace `path` with `bytes`: write a temp file and fsync it, rotate the
/// backups, then rename the temp file over the target.
pub fn write_with_backups(path: &Path, bytes: &[u8], instance_id: &str) -> Result<()> {
    let _lock = StoreLock::acquire(path)?;
    let tmp = sibling(path, &format!("tmp.{instance_id}"));

    let mut file =
        File::create(&tmp).with_context(|| format!("Cannot create {}", tmp.display()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Cannot write {}", tmp.display()))?;
    drop(file);

    for index in (1..BACKUP_COUNT).rev() {
        let older = backup_path(path, index);
        if older.exists() {
            fs::rename(&older, backup_path(path, index + 1))
                .with_context(|| format!("Cannot rotate {}", older.display()))?;
        }
    }
    if path.exists() {
        fs::copy(path, backup_path(path, 1))
            .with_context(|| format!("Cannot back up {}", path.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Cannot move {} into place", tmp.display()))?;
    sync_parent(path);
    Ok(())
}

pub fn backup_path(path: &Path, index: usize) -> PathBuf {
    sibling(path, &format!("bak{index}"))
}

fn corrupt_path_for(path: &Path) -> PathBuf {
    sibling(path, &format!("corrupt.{}", unix_now()))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!("Cannot fsync {}: {err}", parent.display());
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn remember_mtime(context: &AppContext, path: &Path) {
    if let Ok(mtime) = fs::metadata(path).and_then(|meta| meta.modified()) {
        context.record_own_write(path, mtime);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
