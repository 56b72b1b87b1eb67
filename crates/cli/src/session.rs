use crate::config::EngineConfig;
use crate::error::{GenerationError, GenerationResult};
use codeprompt_assembler::{root_display_name, DirectoryTree, DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINES};
use codeprompt_indexer::{ContentCache, FileScanner, RefreshLimiter};
use codeprompt_protocol::{FilterRules, InventoryItem, PathFilter, RuleFilter};
use log::{info, warn};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// What the engine needs to know about a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
    pub name: String,
    pub root: PathBuf,
    pub rules: FilterRules,
    /// Shown in section headers.
    pub prefix: String,
}

impl ProjectSpec {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            rules: FilterRules::default(),
            prefix: String::new(),
        }
    }
}

/// One inventory scan plus the tree rendered from it.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub items: Vec<InventoryItem>,
    pub limit_exceeded: bool,
    pub tree: String,
    pub generation: u64,
}

impl Inventory {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|item| item.is_file())
            .map(|item| item.path.as_str())
    }
}

/// The active project: inventory, content cache and selection.
///
/// The inventory is replaced wholesale after each scan. The selection is
/// only changed by the explicit selection methods.
pub struct ProjectSession {
    spec: ProjectSpec,
    filter: Arc<dyn PathFilter>,
    max_files: usize,
    cache: Arc<ContentCache>,
    inventory: RwLock<Arc<Inventory>>,
    selection: Mutex<BTreeSet<String>>,
    generation: AtomicU64,
}

impl ProjectSession {
    pub async fn open(
        spec: ProjectSpec,
        config: &EngineConfig,
        limiter: RefreshLimiter,
    ) -> GenerationResult<Arc<Self>> {
        if !spec.root.is_dir() {
            return Err(GenerationError::InvalidProjectPath(spec.root.clone()));
        }
        let filter: Arc<dyn PathFilter> = Arc::new(RuleFilter::new(&spec.root, &spec.rules));
        let cache = Arc::new(ContentCache::new(&spec.root, config.max_file_size, limiter));
        let session = Arc::new(Self {
            spec,
            filter,
            max_files: config.max_files,
            cache,
            inventory: RwLock::new(Arc::new(Inventory::default())),
            selection: Mutex::new(BTreeSet::new()),
            generation: AtomicU64::new(0),
        });
        session.rescan().await?;
        Ok(session)
    }

    /// Scan the project again, reset the content cache and drop selected
    /// paths that no longer exist.
    pub async fn rescan(&self) -> GenerationResult<Arc<Inventory>> {
        let root = self.spec.root.clone();
        let filter = self.filter.clone();
        let max_files = self.max_files;
        let scan = tokio::task::spawn_blocking(move || {
            FileScanner::new(&root, max_files).scan(filter.as_ref())
        })
        .await
        .map_err(|err| GenerationError::WorkerFailed(format!("scan task failed: {err}")))??;

        if scan.limit_exceeded {
            warn!(
                "{} has more than {} files; inventory truncated",
                self.spec.name, self.max_files
            );
        }

        let tree = DirectoryTree::build(root_display_name(&self.spec.root), &scan.items)
            .render(DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINES);
        let inventory = Arc::new(Inventory {
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            limit_exceeded: scan.limit_exceeded,
            items: scan.items,
            tree,
        });

        self.cache.initialize(&inventory.items);
        let known: HashSet<&str> = inventory.files().collect();
        let dropped = {
            let mut selection = self.lock_selection();
            let before = selection.len();
            selection.retain(|path| known.contains(path.as_str()));
            before - selection.len()
        };
        if dropped > 0 {
            info!("Dropped {dropped} vanished paths from the selection");
        }

        *self
            .inventory
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = inventory.clone();
        info!(
            "Project {} scanned: {} files (generation {})",
            self.spec.name,
            inventory.files().count(),
            inventory.generation
        );
        Ok(inventory)
    }

    pub fn spec(&self) -> &ProjectSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn root(&self) -> &Path {
        &self.spec.root
    }

    pub fn filter(&self) -> Arc<dyn PathFilter> {
        self.filter.clone()
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn inventory(&self) -> Arc<Inventory> {
        self.inventory
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Sorted snapshot of the selection.
    pub fn selection(&self) -> Vec<String> {
        self.lock_selection().iter().cloned().collect()
    }

    /// Add inventory files to the selection; returns how many were new.
    pub fn select<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inventory = self.inventory();
        let known: HashSet<&str> = inventory.files().collect();
        let mut selection = self.lock_selection();
        let mut added = 0;
        for path in paths {
            let path = path.as_ref();
            if !known.contains(path) {
                warn!("Ignoring selection of unknown path {path}");
                continue;
            }
            if selection.insert(path.to_string()) {
                added += 1;
            }
        }
        added
    }

    pub fn deselect<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selection = self.lock_selection();
        paths
            .into_iter()
            .filter(|path| selection.remove(path.as_ref()))
            .count()
    }

    pub fn select_all(&self) -> usize {
        let inventory = self.inventory();
        let mut selection = self.lock_selection();
        selection.extend(inventory.files().map(str::to_string));
        selection.len()
    }

    pub fn reset_selection(&self) {
        self.lock_selection().clear();
    }

    fn lock_selection(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.selection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    async fn open(root: &Path) -> Arc<ProjectSession> {
        ProjectSession::open(
            ProjectSpec::new("demo", root),
            &EngineConfig::default(),
            RefreshLimiter::new(2),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn missing_root_is_invalid_project() {
        let temp = tempdir().unwrap();
        let result = ProjectSession::open(
            ProjectSpec::new("demo", temp.path().join("missing")),
            &EngineConfig::default(),
            RefreshLimiter::new(1),
        )
        .await;
        assert!(matches!(result, Err(GenerationError::InvalidProjectPath(_))));
    }

    #[tokio::test]
    async fn selection_ops_only_accept_inventory_files() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.py"), "x").unwrap();
        fs::write(temp.path().join("b.py"), "y").unwrap();
        let session = open(temp.path()).await;

        assert_eq!(session.select(["b.py", "a.py", "nope.py"]), 2);
        assert_eq!(session.selection(), vec!["a.py".to_string(), "b.py".to_string()]);
        assert_eq!(session.deselect(["a.py"]), 1);
        assert_eq!(session.selection(), vec!["b.py".to_string()]);
        session.reset_selection();
        assert!(session.selection().is_empty());
        assert_eq!(session.select_all(), 2);
    }

    #[tokio::test]
    async fn rescan_replaces_inventory_and_prunes_selection() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.py"), "x").unwrap();
        fs::write(temp.path().join("b.py"), "y").unwrap();
        let session = open(temp.path()).await;
        session.select(["a.py", "b.py"]);
        let first = session.inventory();

        fs::remove_file(temp.path().join("b.py")).unwrap();
        fs::write(temp.path().join("c.py"), "z").unwrap();
        let second = session.rescan().await.unwrap();

        assert!(second.generation > first.generation);
        assert_eq!(session.selection(), vec!["a.py".to_string()]);
        assert!(second.tree.contains("c.py"));
        assert!(first.files().any(|f| f == "b.py"));
        assert_eq!(session.cache().known_files(), vec!["a.py".to_string(), "c.py".to_string()]);
    }
}
