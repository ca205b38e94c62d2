use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShryncError {
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Job cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ShryncError>;
