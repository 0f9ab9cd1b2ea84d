use hostgrid_core::Retryable;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid coordination path: {0:?}")]
    InvalidPath(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

impl ClusterError {
    pub(crate) fn request(endpoint: &str, source: reqwest::Error) -> Self {
        ClusterError::Request {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}

impl Retryable for ClusterError {
    fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Request { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            ClusterError::Status { status, .. } => *status >= 500 || *status == 429,
            ClusterError::InvalidPath(_) => false,
        }
    }
}
