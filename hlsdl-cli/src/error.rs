use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] hlsdl_engine::DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Download failed: {0}")]
    Failed(String),

    #[error("Download cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AppError>;
