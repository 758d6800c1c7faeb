use mediagrab_engine::{DownloadError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Cancellation or an expired `--deadline`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Download(e) if e.kind() == ErrorKind::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
