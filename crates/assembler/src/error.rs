use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssemblerError>;

#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("Invalid template: {0}")]
    Template(String),

    #[error("Malformed render job: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
