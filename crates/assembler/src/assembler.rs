use crate::placeholders::{finish, substitute, Substitutions};
use codeprompt_protocol::{CachedArtifact, ContentLookup, FileContent};
use log::debug;
use std::fmt::Write as _;

/// Everything a render needs besides file contents.
#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    /// Selected paths in iteration order, usually sorted.
    pub selection: &'a [String],
    pub template: &'a str,
    pub clipboard: &'a str,
    /// Pre-rendered directory tree for `{{dirs}}`.
    pub directory_tree: &'a str,
    /// Project prefix shown in section headers.
    pub prefix: &'a str,
    pub max_content_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeaders {
    pub structure: String,
    pub files_provided: String,
    pub contents: String,
}

impl SectionHeaders {
    pub fn for_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim();
        let header = |title: &str| {
            if prefix.is_empty() {
                format!("### {title}")
            } else {
                format!("### {prefix} {title}")
            }
        };
        Self {
            structure: header("File Structure"),
            files_provided: header("Code Files provided"),
            contents: header("Code Files"),
        }
    }
}

/// Render a prompt from a template and a content snapshot.
///
/// Oversized entries are reported, never embedded, and count their byte size.
/// The file that crosses the budget still counts toward `total_selection_chars`.
/// Unloaded and unknown paths are skipped entirely. Once a file's content
/// would exceed `max_content_size`, it and every later selected file are
/// reported as truncated and the walk stops.
pub fn render<L>(request: &RenderRequest<'_>, lookup: &L) -> CachedArtifact
where
    L: ContentLookup + ?Sized,
{
    let headers = SectionHeaders::for_prefix(request.prefix);

    let mut blocks = String::new();
    let mut included_chars = 0u64;
    let mut total_selection_chars = 0u64;
    let mut oversized_files = Vec::new();
    let mut truncated_files = Vec::new();

    for (idx, path) in request.selection.iter().enumerate() {
        let Some(entry) = lookup.entry(path) else {
            continue;
        };
        match &entry.content {
            FileContent::Pending => continue,
            FileContent::Oversized => {
                oversized_files.push(path.clone());
                total_selection_chars += entry.size;
            }
            FileContent::Loaded(text) => {
                let chars = text.chars().count() as u64;
                total_selection_chars += chars;
                if included_chars + chars > request.max_content_size {
                    truncated_files = request.selection[idx..]
                        .iter()
                        .filter(|rest| is_known(lookup, rest))
                        .cloned()
                        .collect();
                    debug!(
                        "Content budget of {} chars reached at {path}; {} files truncated",
                        request.max_content_size,
                        truncated_files.len()
                    );
                    break;
                }
                included_chars += chars;
                let _ = write!(blocks, "--- {path} ---\n{text}\n--- {path} ---\n");
            }
        }
    }

    let dirs = format!("{}\n\n{}", headers.structure, request.directory_tree.trim());

    let provided: Vec<&str> = request
        .selection
        .iter()
        .filter(|path| is_known(lookup, path))
        .map(String::as_str)
        .collect();
    let files_provided = if provided.is_empty() {
        String::new()
    } else {
        let mut section = headers.files_provided.clone();
        for path in provided {
            section.push_str("\n- ");
            section.push_str(path);
        }
        section
    };

    let file_contents = if blocks.is_empty() {
        String::new()
    } else {
        format!("{}\n\n{blocks}", headers.contents)
    };

    let prompt = substitute(
        request.template,
        &Substitutions {
            dirs: &dirs,
            files_provided: &files_provided,
            file_contents: &file_contents,
            clipboard: request.clipboard,
        },
    );

    CachedArtifact {
        prompt: finish(prompt),
        total_selection_chars,
        oversized_files,
        truncated_files,
    }
}

fn is_known<L: ContentLookup + ?Sized>(lookup: &L, path: &str) -> bool {
    lookup
        .entry(path)
        .is_some_and(|entry| !entry.content.is_pending())
}
