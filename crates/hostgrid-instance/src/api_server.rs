//! One API server per project.
//!
//! Ports are handed out downward from a ceiling: a new project gets one below
//! the lowest port currently allocated. The table is rebuilt from the
//! supervisor's `api-server_` watches on recovery.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hostgrid_core::{
    Outcome, RuntimeLayout, WatchName, api_server_command, validate_project_id,
};
use hostgrid_supervisor::{WatchOptions, WatchSpec, WatchState};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::lifecycle::WatchControl;

const API_SERVER_GROUP: &str = "api-server";

pub struct ApiServerManager {
    control: WatchControl,
    layout: RuntimeLayout,
    coordination_url: String,
    ceiling: u16,
    max_memory_mb: u64,
    /// project id -> port. Held for the whole allocation so concurrent
    /// callers for a new project cannot start two servers.
    ports: Mutex<BTreeMap<String, u16>>,
}

impl ApiServerManager {
    pub(crate) fn new(
        control: WatchControl,
        layout: RuntimeLayout,
        coordination_url: String,
        ceiling: u16,
        max_memory_mb: u64,
    ) -> Self {
        Self {
            control,
            layout,
            coordination_url,
            ceiling,
            max_memory_mb,
            ports: Mutex::new(BTreeMap::new()),
        }
    }

    /// Port of the project's API server, starting one if needed.
    pub async fn ensure(&self, project_id: &str) -> OrchestratorResult<u16> {
        validate_project_id(project_id)?;

        let mut ports = self.ports.lock().await;
        if let Some(&port) = ports.get(project_id) {
            return Ok(port);
        }

        let port = match ports.values().min() {
            Some(lowest) => lowest.checked_sub(1).ok_or_else(|| {
                OrchestratorError::InvalidConfiguration("no API server ports left".to_string())
            })?,
            None => self.ceiling,
        };

        let watch = WatchName::api_server(project_id, port).to_string();
        let command = api_server_command(&self.layout, project_id, port, &self.coordination_url);
        let spec = WatchSpec {
            pidfile: self.control.pidfile(&watch),
            name: watch,
            argv: command.argv,
            env: command.env,
            port,
            max_memory_mb: Some(self.max_memory_mb),
            options: WatchOptions {
                check_port: true,
                check_host: Some("127.0.0.1".to_string()),
                group: Some(API_SERVER_GROUP.to_string()),
                ..WatchOptions::default()
            },
        };

        info!(project = project_id, port, "starting API server");
        self.control.start_watch(&spec).await?;
        ports.insert(project_id.to_string(), port);
        Ok(port)
    }

    /// Stop the project's API server, if it has one.
    pub async fn release(&self, project_id: &str) -> OrchestratorResult<Outcome> {
        let mut ports = self.ports.lock().await;
        let Some(&port) = ports.get(project_id) else {
            debug!(project = project_id, "no API server to stop");
            return Ok(Outcome::AlreadyAbsent);
        };

        let watch = WatchName::api_server(project_id, port).to_string();
        self.control.unmonitor_and_terminate(&watch).await?;
        ports.remove(project_id);
        info!(project = project_id, port, "stopped API server");
        Ok(Outcome::Applied)
    }

    /// Replace the table with the monitored API-server watches in `watches`.
    pub async fn populate(&self, watches: &BTreeMap<String, WatchState>) {
        let mut found = BTreeMap::new();
        for (name, state) in watches {
            if !state.is_monitored() {
                continue;
            }
            let Some(WatchName::ApiServer { project_id, port }) = WatchName::parse(name) else {
                continue;
            };
            if let Some(existing) = found.insert(project_id.clone(), port) {
                warn!(project = %project_id, existing, port, "duplicate API server watches");
            }
        }
        info!(count = found.len(), "recovered API servers");
        *self.ports.lock().await = found;
    }

    pub async fn snapshot(&self) -> BTreeMap<String, u16> {
        self.ports.lock().await.clone()
    }
}
