use hostgrid_core::Retryable;
use hostgrid_core::source::SourceUriError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Uri(#[from] SourceUriError),

    #[error("download of {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download of {url} returned HTTP {status}")]
    DownloadStatus { url: String, status: u16 },

    #[error("invalid source archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type SourceResult<T> = Result<T, SourceError>;

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::Download { source, .. } => source.is_connect() || source.is_timeout(),
            SourceError::DownloadStatus { status, .. } => *status >= 500,
            SourceError::Uri(_)
            | SourceError::Archive(_)
            | SourceError::Io(_)
            | SourceError::Join(_) => false,
        }
    }
}
