use anyhow::{Context, Result};
use codeprompt_protocol::OutputSink;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sidecar written next to every saved prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub project: String,
    pub source_template: String,
    pub selection: Vec<String>,
    pub timestamp_ms: u64,
    pub bytes: u64,
}

/// Saves prompts as `<dir>/<project>_<unix_ms>.md` plus `.meta.json`.
pub struct FileOutputSink {
    dir: PathBuf,
}

impl FileOutputSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn target(&self, project: &str) -> Result<(PathBuf, u64)> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create output dir {}", self.dir.display()))?;
        let stem = safe_file_stem(project);
        let mut timestamp_ms = unix_ms_now();
        loop {
            let path = self.dir.join(format!("{stem}_{timestamp_ms}.md"));
            if !path.exists() {
                return Ok((path, timestamp_ms));
            }
            timestamp_ms += 1;
        }
    }

    fn write_meta(
        path: &Path,
        project: &str,
        source_template: &str,
        selection: &[String],
        timestamp_ms: u64,
    ) -> Result<()> {
        let bytes = fs::metadata(path)
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len();
        let meta = OutputMeta {
            project: project.to_string(),
            source_template: source_template.to_string(),
            selection: selection.to_vec(),
            timestamp_ms,
            bytes,
        };
        let meta_path = meta_path_for(path);
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("Cannot write {}", meta_path.display()))?;
        Ok(())
    }
}

impl OutputSink for FileOutputSink {
    fn save(
        &self,
        content: &str,
        project: &str,
        source_template: &str,
        selection: &[String],
    ) -> Result<PathBuf> {
        let (path, timestamp_ms) = self.target(project)?;
        fs::write(&path, content).with_context(|| format!("Cannot write {}", path.display()))?;
        Self::write_meta(&path, project, source_template, selection, timestamp_ms)?;
        info!("Saved prompt to {}", path.display());
        Ok(path)
    }

    /// Moves the staged file into place; falls back to copying when the
    /// rename crosses filesystems.
    fn save_from_file(
        &self,
        staged: &Path,
        project: &str,
        source_template: &str,
        selection: &[String],
    ) -> Result<PathBuf> {
        let (path, timestamp_ms) = self.target(project)?;
        if let Err(err) = fs::rename(staged, &path) {
            debug!("Rename of {} failed ({err}), copying", staged.display());
            fs::copy(staged, &path)
                .with_context(|| format!("Cannot copy {} to {}", staged.display(), path.display()))?;
            if let Err(err) = fs::remove_file(staged) {
                debug!("Leaving staged prompt {}: {err}", staged.display());
            }
        }
        Self::write_meta(&path, project, source_template, selection, timestamp_ms)?;
        info!("Saved prompt to {}", path.display());
        Ok(path)
    }
}

/// Project name reduced to ASCII alphanumerics, space and `_`.
pub fn safe_file_stem(project: &str) -> String {
    let safe: String = project
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '_')
        .collect();
    let safe = safe.trim_end();
    if safe.is_empty() {
        "output".to_string()
    } else {
        safe.to_string()
    }
}

pub fn meta_path_for(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn safe_stem_filters_characters() {
        assert_eq!(safe_file_stem("my-app v2/beta"), "myapp v2beta");
        assert_eq!(safe_file_stem("???"), "output");
        assert_eq!(safe_file_stem("snake_case"), "snake_case");
    }

    #[test]
    fn save_writes_prompt_and_meta() {
        let temp = tempdir().unwrap();
        let sink = FileOutputSink::new(temp.path().join("out"));
        let selection = vec!["a.py".to_string()];
        let path = sink.save("hello\n", "demo", "Default", &selection).unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().starts_with("demo_"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
        let meta: OutputMeta =
            serde_json::from_slice(&fs::read(meta_path_for(&path)).unwrap()).unwrap();
        assert_eq!(meta.project, "demo");
        assert_eq!(meta.source_template, "Default");
        assert_eq!(meta.selection, selection);
        assert_eq!(meta.bytes, 6);
    }

    #[test]
    fn save_from_file_moves_staged_prompt() {
        let temp = tempdir().unwrap();
        let staged = temp.path().join("staged.md");
        fs::write(&staged, "prompt").unwrap();
        let sink = FileOutputSink::new(temp.path().join("out"));

        let first = sink.save_from_file(&staged, "demo", "Default", &[]).unwrap();
        assert!(!staged.exists());
        assert_eq!(fs::read_to_string(&first).unwrap(), "prompt");

        let second = sink.save("again", "demo", "Default", &[]).unwrap();
        assert_ne!(first, second);
    }
}
