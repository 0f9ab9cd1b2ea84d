use hostgrid_core::Retryable;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid watch name: {0:?}")]
    InvalidWatchName(String),

    #[error("invalid watch spec for {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    #[error("supervisor is not currently available: {0}")]
    Unavailable(String),

    #[error("supervisor returned HTTP {status} for {action} on {name}")]
    Http {
        name: String,
        action: String,
        status: u16,
    },

    #[error("supervisor request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("supervisor reload failed: {0}")]
    Reload(String),

    #[error("malformed supervisor status: {0}")]
    MalformedStatus(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

impl Retryable for SupervisorError {
    fn is_retryable(&self) -> bool {
        match self {
            SupervisorError::Unavailable(_) | SupervisorError::Reload(_) => true,
            SupervisorError::Http { status, .. } => *status >= 500,
            SupervisorError::Request(e) => e.is_connect() || e.is_timeout(),
            SupervisorError::Io(_) => true,
            SupervisorError::InvalidWatchName(_)
            | SupervisorError::InvalidSpec { .. }
            | SupervisorError::MalformedStatus(_) => false,
        }
    }
}
