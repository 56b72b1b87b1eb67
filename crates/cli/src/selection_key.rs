use blake3::Hasher;
use codeprompt_indexer::mtime_nanos;
use codeprompt_protocol::uses_clipboard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Fingerprint addressing one rendered prompt.
///
/// Covers the project, the sorted selection with each file's current
/// on-disk mtime, the template name and body, and the clipboard text when
/// the template reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionKey(String);

impl SelectionKey {
    pub fn compute(
        project: &str,
        root: &Path,
        selected: &[String],
        template_id: &str,
        template_content: &str,
        clipboard: &str,
    ) -> Self {
        let mut paths: Vec<&str> = selected.iter().map(String::as_str).collect();
        paths.sort_unstable();
        paths.dedup();

        let mut hasher = Hasher::new();
        update_field(&mut hasher, project.as_bytes());
        update_field(&mut hasher, root.to_string_lossy().as_bytes());
        hasher.update(&(paths.len() as u64).to_le_bytes());
        for path in paths {
            update_field(&mut hasher, path.as_bytes());
            hasher.update(&disk_mtime(root, path).to_le_bytes());
        }
        update_field(&mut hasher, template_id.as_bytes());
        update_field(&mut hasher, template_content.as_bytes());
        if uses_clipboard(template_content) {
            hasher.update(b"\x01");
            update_field(&mut hasher, clipboard.as_bytes());
        } else {
            hasher.update(b"\x00");
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Length prefix keeps ("ab", "c") and ("a", "bc") apart.
fn update_field(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn disk_mtime(root: &Path, rel: &str) -> u64 {
    std::fs::metadata(root.join(rel)).map_or(0, |meta| mtime_nanos(&meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn pin_mtime(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn key(root: &Path, selected: &[&str], template: &str, clipboard: &str) -> SelectionKey {
        let selected: Vec<String> = selected.iter().map(ToString::to_string).collect();
        SelectionKey::compute("demo", root, &selected, "Default", template, clipboard)
    }

    #[test]
    fn order_does_not_matter_but_mtime_does() {
        let temp = tempdir().unwrap();
        for name in ["a.py", "b.py", "other.py"] {
            fs::write(temp.path().join(name), name).unwrap();
            pin_mtime(&temp.path().join(name), 1_000);
        }
        let first = key(temp.path(), &["a.py", "b.py"], "{{file_contents}}", "");
        let reordered = key(temp.path(), &["b.py", "a.py"], "{{file_contents}}", "");
        assert_eq!(first, reordered);
        assert_eq!(first.as_str().len(), 64);

        pin_mtime(&temp.path().join("other.py"), 2_000);
        assert_eq!(first, key(temp.path(), &["a.py", "b.py"], "{{file_contents}}", ""));

        pin_mtime(&temp.path().join("b.py"), 2_000);
        assert_ne!(first, key(temp.path(), &["a.py", "b.py"], "{{file_contents}}", ""));
    }

    #[test]
    fn clipboard_only_counts_when_template_reads_it() {
        let temp = tempdir().unwrap();
        let plain = "{{file_contents}}";
        assert_eq!(
            key(temp.path(), &[], plain, "one"),
            key(temp.path(), &[], plain, "two")
        );
        let with_clip = "{{CLIPBOARD}}";
        assert_ne!(
            key(temp.path(), &[], with_clip, "one"),
            key(temp.path(), &[], with_clip, "two")
        );
    }

    #[test]
    fn template_body_and_missing_files_are_covered() {
        let temp = tempdir().unwrap();
        assert_ne!(
            key(temp.path(), &["gone.py"], "{{dirs}}", ""),
            key(temp.path(), &["gone.py"], "{{dirs}} ", "")
        );
        assert_eq!(
            key(temp.path(), &["gone.py"], "{{dirs}}", ""),
            key(temp.path(), &["gone.py", "gone.py"], "{{dirs}}", "")
        );
    }
}
