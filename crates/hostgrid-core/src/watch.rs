//! Supervisor watch naming.
//!
//! Instance watches are `app___{revision-dir}-{port}` and API-server watches
//! are `api-server_{project}-{port}`. Both forms must round-trip: the agent's
//! in-memory state is rebuilt from these names after a restart.

use std::fmt;

use crate::types::{RevisionKey, validate_project_id};

pub const INSTANCE_WATCH_PREFIX: &str = "app___";
pub const API_SERVER_WATCH_PREFIX: &str = "api-server_";

/// A parsed supervisor watch name owned by this agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchName {
    Instance { revision_key: RevisionKey, port: u16 },
    ApiServer { project_id: String, port: u16 },
}

impl WatchName {
    pub fn instance(revision_key: &RevisionKey, port: u16) -> Self {
        WatchName::Instance {
            revision_key: revision_key.clone(),
            port,
        }
    }

    pub fn api_server(project_id: &str, port: u16) -> Self {
        WatchName::ApiServer {
            project_id: project_id.to_string(),
            port,
        }
    }

    /// Parse a raw watch name. Returns `None` for names this agent does not own
    /// or cannot decode.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix(INSTANCE_WATCH_PREFIX) {
            let (dir, port) = rest.rsplit_once('-')?;
            let port = port.parse::<u16>().ok()?;
            let revision_key = RevisionKey::from_dir_name(dir).ok()?;
            Some(WatchName::Instance { revision_key, port })
        } else if let Some(rest) = name.strip_prefix(API_SERVER_WATCH_PREFIX) {
            let (project_id, port) = rest.rsplit_once('-')?;
            let port = port.parse::<u16>().ok()?;
            validate_project_id(project_id).ok()?;
            Some(WatchName::ApiServer {
                project_id: project_id.to_string(),
                port,
            })
        } else {
            None
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            WatchName::Instance { port, .. } | WatchName::ApiServer { port, .. } => *port,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            WatchName::Instance { revision_key, .. } => revision_key.project_id(),
            WatchName::ApiServer { project_id, .. } => project_id,
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, WatchName::Instance { .. })
    }
}

impl fmt::Display for WatchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchName::Instance { revision_key, port } => {
                write!(f, "{INSTANCE_WATCH_PREFIX}{}-{port}", revision_key.dir_name())
            }
            WatchName::ApiServer { project_id, port } => {
                write!(f, "{API_SERVER_WATCH_PREFIX}{project_id}-{port}")
            }
        }
    }
}
