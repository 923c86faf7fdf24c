use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("AI provider request failed: {0}")]
    Provider(String),

    #[error("response was truncated")]
    Truncated,

    #[error("failed to parse model response as JSON: {0}")]
    Parse(String),

    #[error("batch job not found: {0}")]
    BatchNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
