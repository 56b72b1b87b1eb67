use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Decides whether a project-relative path is left out of the inventory.
pub trait PathFilter: Send + Sync {
    fn should_ignore(&self, rel_path: &str, is_dir: bool) -> bool;
}

/// Keeps everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilter;

impl PathFilter for NoFilter {
    fn should_ignore(&self, _rel_path: &str, _is_dir: bool) -> bool {
        false
    }
}

/// Deny/keep lists for one project, already merged with the global lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub respect_gitignore: bool,
    pub deny: Vec<String>,
    pub keep: Vec<String>,
}

impl FilterRules {
    #[must_use]
    pub fn merged(project: &Self, global_deny: &[String], global_keep: &[String]) -> Self {
        let mut deny = project.deny.clone();
        deny.extend(global_deny.iter().cloned());
        let mut keep = project.keep.clone();
        keep.extend(global_keep.iter().cloned());
        dedup_preserving_order(&mut deny);
        dedup_preserving_order(&mut keep);
        Self {
            respect_gitignore: project.respect_gitignore,
            deny,
            keep,
        }
    }
}

#[derive(Debug, Clone)]
enum Rule {
    /// No `/` in the entry: glob against path segments (deny) or the basename (keep).
    Segment(glob::Pattern),
    /// Trailing `/`: a directory and everything below it.
    Dir(String),
    /// Any other entry: exact path, full-path glob, or path prefix.
    Path {
        raw: String,
        pattern: Option<glob::Pattern>,
    },
}

impl Rule {
    fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().replace('\\', "/").to_lowercase();
        let is_dir = lowered.ends_with('/');
        let value = normalize_filter_path(&lowered);
        if value.is_empty() {
            return None;
        }
        if is_dir {
            return Some(Self::Dir(value));
        }
        if !value.contains('/') {
            return glob::Pattern::new(&value)
                .ok()
                .or_else(|| glob::Pattern::new(&glob::Pattern::escape(&value)).ok())
                .map(Self::Segment);
        }
        let pattern = glob::Pattern::new(&value).ok();
        Some(Self::Path {
            raw: value,
            pattern,
        })
    }

    fn keeps(&self, path: &str, is_dir: bool) -> bool {
        match self {
            Self::Segment(pattern) => pattern.matches(basename(path)),
            Self::Dir(dir) => path == dir || path_prefix_matches_normalized(dir, path),
            Self::Path { raw, pattern } => {
                if is_dir {
                    return path_prefix_matches_normalized(path, raw);
                }
                path == raw
                    || pattern.as_ref().is_some_and(|p| p.matches(path))
                    || path_prefix_matches_normalized(raw, path)
            }
        }
    }

    fn denies(&self, path: &str) -> bool {
        match self {
            Self::Segment(pattern) => path.split('/').any(|part| pattern.matches(part)),
            Self::Dir(dir) => {
                path == dir
                    || path_prefix_matches_normalized(dir, path)
                    || format!("/{path}/").contains(&format!("/{dir}/"))
            }
            Self::Path { raw, pattern } => {
                path == raw
                    || pattern.as_ref().is_some_and(|p| p.matches(path))
                    || path_prefix_matches_normalized(raw, path)
            }
        }
    }

    /// Directories that lead to an explicitly kept path stay walkable.
    fn leads_into(&self, dir: &str) -> bool {
        match self {
            Self::Segment(_) => false,
            Self::Dir(target) | Self::Path { raw: target, .. } => {
                path_prefix_matches_normalized(dir, target)
            }
        }
    }
}

/// Rule-based filter combining keep-list, deny-list and `.gitignore`.
///
/// Precedence: keep-list > deny-list > gitignore. Matching is
/// case-insensitive on `/`-separated relative paths.
pub struct RuleFilter {
    deny: Vec<Rule>,
    keep: Vec<Rule>,
    gitignore: Option<Gitignore>,
}

impl RuleFilter {
    /// Build a filter for `root`, loading `<root>/.gitignore` when requested.
    pub fn new(root: &Path, rules: &FilterRules) -> Self {
        let mut filter = Self::from_patterns(&rules.deny, &rules.keep);
        if rules.respect_gitignore {
            filter.gitignore = load_gitignore(root);
        }
        filter
    }

    pub fn from_patterns(deny: &[String], keep: &[String]) -> Self {
        Self {
            deny: deny.iter().filter_map(|raw| Rule::parse(raw)).collect(),
            keep: keep.iter().filter_map(|raw| Rule::parse(raw)).collect(),
            gitignore: None,
        }
    }

    #[must_use]
    pub fn has_gitignore(&self) -> bool {
        self.gitignore.is_some()
    }
}

impl PathFilter for RuleFilter {
    fn should_ignore(&self, rel_path: &str, is_dir: bool) -> bool {
        let path = normalize_filter_path(&rel_path.to_lowercase());
        if path.is_empty() {
            return false;
        }

        if self.keep.iter().any(|rule| rule.keeps(&path, is_dir)) {
            return false;
        }
        if is_dir && self.keep.iter().any(|rule| rule.leads_into(&path)) {
            return false;
        }

        if self.deny.iter().any(|rule| rule.denies(&path)) {
            return true;
        }

        self.gitignore.as_ref().is_some_and(|gitignore| {
            gitignore
                .matched_path_or_any_parents(rel_path.replace('\\', "/"), is_dir)
                .is_ignore()
        })
    }
}

fn load_gitignore(root: &Path) -> Option<Gitignore> {
    let path = root.join(".gitignore");
    if !path.is_file() {
        return None;
    }
    let mut builder = GitignoreBuilder::new(root);
    if let Err(err) = builder.case_insensitive(true) {
        log::warn!("gitignore case folding unavailable: {err}");
    }
    if let Some(err) = builder.add(&path) {
        log::warn!("Could not read {}: {err}", path.display());
    }
    match builder.build() {
        Ok(gitignore) => Some(gitignore),
        Err(err) => {
            log::warn!("Invalid gitignore at {}: {err}", path.display());
            None
        }
    }
}

fn normalize_filter_path(raw: &str) -> String {
    let mut value = raw.trim().replace('\\', "/");
    while value.starts_with("./") {
        value = value[2..].to_string();
    }
    let value = value.trim_matches('/');
    if value == "." {
        return String::new();
    }
    value.to_string()
}

fn path_prefix_matches_normalized(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }

    path.as_bytes().get(prefix.len()) == Some(&b'/')
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dedup_preserving_order(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|value| seen.insert(value.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn segment_deny_matches_any_component() {
        let filter = RuleFilter::from_patterns(&strings(&["node_modules", "*.log"]), &[]);
        assert!(filter.should_ignore("node_modules", true));
        assert!(filter.should_ignore("web/node_modules/react/index.js", false));
        assert!(filter.should_ignore("logs/today.LOG", false));
        assert!(!filter.should_ignore("src/main.rs", false));
    }

    #[test]
    fn dir_deny_matches_nested_directory() {
        let filter = RuleFilter::from_patterns(&strings(&["build/"]), &[]);
        assert!(filter.should_ignore("build", true));
        assert!(filter.should_ignore("build/out.o", false));
        assert!(filter.should_ignore("pkg/build/out.o", false));
        assert!(!filter.should_ignore("builder/main.rs", false));
    }

    #[test]
    fn path_deny_is_prefix_or_glob() {
        let filter = RuleFilter::from_patterns(&strings(&["src/gen", "docs/*.md"]), &[]);
        assert!(filter.should_ignore("src/gen", true));
        assert!(filter.should_ignore("src/gen/mod.rs", false));
        assert!(!filter.should_ignore("src/generic.rs", false));
        assert!(filter.should_ignore("docs/intro.md", false));
    }

    #[test]
    fn keep_overrides_deny_by_basename_and_prefix() {
        let filter = RuleFilter::from_patterns(
            &strings(&["vendor", "*.json"]),
            &strings(&["package.json", "vendor/patched/"]),
        );
        assert!(!filter.should_ignore("package.json", false));
        assert!(filter.should_ignore("tsconfig.json", false));
        assert!(!filter.should_ignore("vendor/patched/lib.c", false));
        assert!(!filter.should_ignore("vendor/patched", true));
        // ancestor of a kept directory stays walkable
        assert!(!filter.should_ignore("vendor", true));
        assert!(filter.should_ignore("vendor/other/lib.c", false));
    }

    #[test]
    fn gitignore_applies_after_lists() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".gitignore"), "target/\n*.tmp\n!keep.tmp\n").unwrap();
        let rules = FilterRules {
            respect_gitignore: true,
            deny: Vec::new(),
            keep: strings(&["scratch.tmp"]),
        };
        let filter = RuleFilter::new(temp.path(), &rules);
        assert!(filter.has_gitignore());
        assert!(filter.should_ignore("target", true));
        assert!(filter.should_ignore("target/debug/app", false));
        assert!(filter.should_ignore("a.tmp", false));
        assert!(!filter.should_ignore("keep.tmp", false));
        assert!(!filter.should_ignore("scratch.tmp", false));
        assert!(!filter.should_ignore("src/lib.rs", false));
    }

    #[test]
    fn gitignore_skipped_when_not_respected() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".gitignore"), "*.tmp\n").unwrap();
        let filter = RuleFilter::new(temp.path(), &FilterRules::default());
        assert!(!filter.has_gitignore());
        assert!(!filter.should_ignore("a.tmp", false));
    }

    #[test]
    fn blank_entries_are_inert() {
        let filter = RuleFilter::from_patterns(&strings(&["", ".", "./", "/"]), &[]);
        assert!(!filter.should_ignore("src/lib.rs", false));
    }

    #[test]
    fn merged_rules_dedup() {
        let project = FilterRules {
            respect_gitignore: true,
            deny: strings(&["dist"]),
            keep: strings(&["a.txt"]),
        };
        let merged = FilterRules::merged(&project, &strings(&["dist", "tmp"]), &strings(&["b.txt"]));
        assert_eq!(merged.deny, strings(&["dist", "tmp"]));
        assert_eq!(merged.keep, strings(&["a.txt", "b.txt"]));
        assert!(merged.respect_gitignore);
    }
}
