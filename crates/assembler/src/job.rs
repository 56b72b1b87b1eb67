use crate::assembler::{render, RenderRequest};
use crate::{AssemblerError, Result};
use codeprompt_protocol::{CachedArtifact, ContentEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Self-contained render input that can cross a process boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderJob {
    pub selection: Vec<String>,
    pub template: String,
    #[serde(default)]
    pub clipboard: String,
    #[serde(default)]
    pub directory_tree: String,
    #[serde(default)]
    pub prefix: String,
    pub max_content_size: u64,
    /// Snapshot of the selected files only.
    #[serde(default)]
    pub files: HashMap<String, ContentEntry>,
}

/// Worker reply: the artifact, or why it could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenderOutcome {
    Rendered { artifact: CachedArtifact },
    Failed { reason: String },
}

impl RenderJob {
    pub fn request(&self) -> RenderRequest<'_> {
        RenderRequest {
            selection: &self.selection,
            template: &self.template,
            clipboard: &self.clipboard,
            directory_tree: &self.directory_tree,
            prefix: &self.prefix,
            max_content_size: self.max_content_size,
        }
    }

    pub fn render(&self) -> Result<CachedArtifact> {
        if self.template.trim().is_empty() {
            return Err(AssemblerError::Template("template is empty".to_string()));
        }
        Ok(render(&self.request(), &self.files))
    }

    pub fn read_from(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write_to(&self, writer: impl Write) -> Result<()> {
        Ok(serde_json::to_writer(writer, self)?)
    }
}

impl RenderOutcome {
    pub fn into_result(self) -> std::result::Result<CachedArtifact, String> {
        match self {
            Self::Rendered { artifact } => Ok(artifact),
            Self::Failed { reason } => Err(reason),
        }
    }
}

impl From<Result<CachedArtifact>> for RenderOutcome {
    fn from(result: Result<CachedArtifact>) -> Self {
        match result {
            Ok(artifact) => Self::Rendered { artifact },
            Err(err) => Self::Failed {
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeprompt_protocol::FileContent;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn job() -> RenderJob {
        let mut files = HashMap::new();
        files.insert(
            "a.py".to_string(),
            ContentEntry {
                path: "a.py".to_string(),
                content: FileContent::Loaded(Arc::from("x")),
                size: 1,
                mtime: 5,
            },
        );
        RenderJob {
            selection: vec!["a.py".to_string()],
            template: "{{file_contents}}".to_string(),
            max_content_size: 100,
            files,
            ..RenderJob::default()
        }
    }

    #[test]
    fn job_survives_the_wire_and_renders() {
        let mut wire = Vec::new();
        job().write_to(&mut wire).unwrap();
        let decoded = RenderJob::read_from(wire.as_slice()).unwrap();
        assert_eq!(decoded, job());

        let artifact = decoded.render().unwrap();
        assert_eq!(artifact.prompt, "### Code Files\n\n--- a.py ---\nx\n--- a.py ---\n");
    }

    #[test]
    fn blank_template_is_rejected() {
        let blank = RenderJob {
            template: "  \n".to_string(),
            ..job()
        };
        let outcome = RenderOutcome::from(blank.render());
        assert!(matches!(outcome, RenderOutcome::Failed { .. }));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = RenderJob::read_from("{not json".as_bytes()).unwrap_err();
        assert!(matches!(err, AssemblerError::Json(_)));
    }
}
