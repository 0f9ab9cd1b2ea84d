//! Orchestrator error types.

use hostgrid_cluster::ClusterError;
use hostgrid_core::{KeyError, LaunchError};
use hostgrid_source::SourceError;
use hostgrid_supervisor::SupervisorError;
use thiserror::Error;

/// How a caller should treat a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-caused and not retryable. No side effects happened.
    InvalidConfiguration,
    /// A collaborator stayed unavailable after bounded retries.
    CollaboratorUnavailable,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("coordination error: {0}")]
    Coordination(#[source] ClusterError),

    #[error("routing error: {0}")]
    Routing(#[source] ClusterError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("host process error: {0}")]
    Host(#[from] HostError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidConfiguration(_)
            | OrchestratorError::Source(SourceError::Uri(_))
            | OrchestratorError::Supervisor(
                SupervisorError::InvalidSpec { .. } | SupervisorError::InvalidWatchName(_),
            ) => ErrorKind::InvalidConfiguration,
            _ => ErrorKind::CollaboratorUnavailable,
        }
    }
}

impl From<KeyError> for OrchestratorError {
    fn from(e: KeyError) -> Self {
        OrchestratorError::InvalidConfiguration(e.to_string())
    }
}

impl From<LaunchError> for OrchestratorError {
    fn from(e: LaunchError) -> Self {
        OrchestratorError::InvalidConfiguration(e.to_string())
    }
}

/// Errors from enumerating or signalling host processes.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("process listing failed: {0}")]
    Listing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_split_caller_and_collaborator_faults() {
        let invalid = OrchestratorError::InvalidConfiguration("version not found".into());
        assert_eq!(invalid.kind(), ErrorKind::InvalidConfiguration);

        let launch: OrchestratorError = LaunchError::UnknownRuntime("cobol".into()).into();
        assert_eq!(launch.kind(), ErrorKind::InvalidConfiguration);

        let busy = OrchestratorError::Supervisor(SupervisorError::Unavailable("503".into()));
        assert_eq!(busy.kind(), ErrorKind::CollaboratorUnavailable);
    }
}
