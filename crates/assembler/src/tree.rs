use codeprompt_protocol::{InventoryItem, ItemKind};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MAX_LINES: usize = 1000;
pub const TRUNCATION_MARKER: &str = "... (output truncated due to size limits)";

const INDENT: &str = "    ";

/// Files are nodes with `is_dir == false` and no children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TreeNode {
    is_dir: bool,
    children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    fn file() -> Self {
        Self::default()
    }
}

/// Prefix tree of one inventory scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryTree {
    root_name: String,
    children: BTreeMap<String, TreeNode>,
}

impl DirectoryTree {
    pub fn build(root_name: impl Into<String>, items: &[InventoryItem]) -> Self {
        let mut children = BTreeMap::new();
        for item in items {
            let parts: Vec<&str> = item
                .path
                .trim_matches('/')
                .split('/')
                .filter(|part| !part.is_empty())
                .collect();
            let Some((last, parents)) = parts.split_last() else {
                continue;
            };

            let mut level = &mut children;
            for part in parents {
                level = descend(level, part);
            }
            match item.kind {
                ItemKind::File => {
                    level.insert((*last).to_string(), TreeNode::file());
                }
                ItemKind::Dir => {
                    descend(level, last);
                }
            }
        }
        Self {
            root_name: root_name.into(),
            children,
        }
    }

    /// Root line is `<root_name>/`; entries are indented four spaces per
    /// level, directories before files, each group sorted.
    pub fn render(&self, max_depth: usize, max_lines: usize) -> String {
        let mut lines = vec![format!("{}/", self.root_name)];
        render_level(&self.children, 0, max_depth, max_lines, &mut lines);
        if lines.len() >= max_lines {
            lines.push(TRUNCATION_MARKER.to_string());
        }
        lines.join("\n")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

fn descend<'m>(
    level: &'m mut BTreeMap<String, TreeNode>,
    name: &str,
) -> &'m mut BTreeMap<String, TreeNode> {
    let node = level.entry(name.to_string()).or_default();
    node.is_dir = true;
    &mut node.children
}

fn render_level(
    node: &BTreeMap<String, TreeNode>,
    depth: usize,
    max_depth: usize,
    max_lines: usize,
    lines: &mut Vec<String>,
) {
    if depth >= max_depth {
        return;
    }
    let indent = INDENT.repeat(depth + 1);

    for (name, child) in node {
        if !child.is_dir {
            continue;
        }
        if lines.len() >= max_lines {
            return;
        }
        lines.push(format!("{indent}{name}/"));
        if lines.len() < max_lines {
            render_level(&child.children, depth + 1, max_depth, max_lines, lines);
        }
    }
    for (name, child) in node {
        if child.is_dir {
            continue;
        }
        if lines.len() >= max_lines {
            return;
        }
        lines.push(format!("{indent}{name}"));
    }
}

/// Display name of a project root for the tree's first line.
pub fn root_display_name(root: &Path) -> String {
    root.file_name().map_or_else(
        || root.display().to_string(),
        |name| name.to_string_lossy().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn items() -> Vec<InventoryItem> {
        vec![
            InventoryItem::file("b.py"),
            InventoryItem::file("a.py"),
            InventoryItem::dir("sub"),
            InventoryItem::file("sub/c.py"),
            InventoryItem::dir("empty"),
        ]
    }

    #[test]
    fn directories_render_before_files() {
        let tree = DirectoryTree::build("proj", &items());
        assert_eq!(
            tree.render(DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINES),
            "proj/\n    empty/\n    sub/\n        c.py\n    a.py\n    b.py"
        );
    }

    #[test]
    fn depth_cap_hides_nested_entries() {
        let tree = DirectoryTree::build("proj", &items());
        assert_eq!(tree.render(1, 100), "proj/\n    empty/\n    sub/\n    a.py\n    b.py");
    }

    #[test]
    fn line_cap_appends_marker() {
        let tree = DirectoryTree::build("proj", &items());
        let rendered = tree.render(DEFAULT_MAX_DEPTH, 3);
        assert_eq!(
            rendered,
            format!("proj/\n    empty/\n    sub/\n{TRUNCATION_MARKER}")
        );
    }

    #[test]
    fn file_becomes_directory_when_it_gains_children() {
        let items = vec![
            InventoryItem::file("docs"),
            InventoryItem::file("docs/readme.md"),
            InventoryItem::file("z.py"),
        ];
        let tree = DirectoryTree::build("proj", &items);
        assert_eq!(
            tree.render(DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINES),
            "proj/\n    docs/\n        readme.md\n    z.py"
        );
    }

    #[test]
    fn root_name_uses_basename() {
        assert_eq!(root_display_name(Path::new("/work/my-app")), "my-app");
    }
}
