use codeprompt_indexer::IndexerError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type GenerationResult<T> = std::result::Result<T, GenerationError>;

/// Whole-operation failures. Per-file problems never surface here; they are
/// reported as data on the artifact.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Project path is missing or not a directory: {}", .0.display())]
    InvalidProjectPath(PathBuf),

    #[error("No project is open")]
    NoActiveProject,

    #[error("No files selected")]
    EmptySelection,

    #[error("Too many files selected: {selected} (limit {max})")]
    SelectionTooLarge { selected: usize, max: usize },

    #[error("Template '{0}' is missing or empty")]
    InvalidTemplate(String),

    #[error("Render worker timed out after {0:?}")]
    ProcessPoolTimeout(Duration),

    #[error("Render worker failed: {0}")]
    WorkerFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to save prompt: {0}")]
    Save(String),
}

impl GenerationError {
    /// Stable identifier for the presentation layer.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidProjectPath(_) => "invalid_project_path",
            Self::NoActiveProject => "no_active_project",
            Self::EmptySelection => "empty_selection",
            Self::SelectionTooLarge { .. } => "selection_too_large",
            Self::InvalidTemplate(_) => "invalid_template",
            Self::ProcessPoolTimeout(_) => "process_pool_timeout",
            Self::WorkerFailed(_) => "worker_failed",
            Self::Io(_) => "io",
            Self::Save(_) => "save",
        }
    }

    /// Validation failures are raised before any work starts.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidProjectPath(_)
                | Self::NoActiveProject
                | Self::EmptySelection
                | Self::SelectionTooLarge { .. }
                | Self::InvalidTemplate(_)
        )
    }
}

impl From<IndexerError> for GenerationError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::InvalidPath(path) => Self::InvalidProjectPath(PathBuf::from(path)),
            IndexerError::IoError(err) => Self::Io(err),
            other => Self::WorkerFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_and_validation_is_flagged() {
        let err = GenerationError::SelectionTooLarge {
            selected: 600,
            max: 500,
        };
        assert_eq!(err.kind(), "selection_too_large");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Too many files selected: 600 (limit 500)");

        let err = GenerationError::ProcessPoolTimeout(Duration::from_secs(60));
        assert_eq!(err.kind(), "process_pool_timeout");
        assert!(!err.is_validation());
    }

    #[test]
    fn indexer_invalid_path_maps_to_project_error() {
        let err = GenerationError::from(IndexerError::InvalidPath("/nope".to_string()));
        assert!(matches!(err, GenerationError::InvalidProjectPath(_)));
    }
}
