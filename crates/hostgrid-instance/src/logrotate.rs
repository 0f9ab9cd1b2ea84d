//! Per-project logrotate configuration.

use std::path::{Path, PathBuf};

use tracing::{debug, error};

use hostgrid_core::watch::INSTANCE_WATCH_PREFIX;

#[derive(Debug, Clone)]
pub struct LogRotation {
    config_dir: PathBuf,
    log_dir: PathBuf,
    max_size_mb: u64,
}

impl LogRotation {
    pub fn new(config_dir: &Path, log_dir: &Path, max_size_mb: u64) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
            max_size_mb,
        }
    }

    pub fn config_path(&self, project_id: &str) -> PathBuf {
        self.config_dir.join(format!("hostgrid-{project_id}"))
    }

    /// Log file of one instance or API-server watch.
    pub fn log_file(&self, watch: &str) -> PathBuf {
        self.log_dir.join(format!("{watch}.log"))
    }

    fn render(&self, project_id: &str) -> String {
        let pattern = self
            .log_dir
            .join(format!("{INSTANCE_WATCH_PREFIX}{project_id}_*.log"));
        format!(
            "{} {{\n  size {}M\n  missingok\n  rotate 7\n  compress\n  delaycompress\n  notifempty\n  copytruncate\n}}\n",
            pattern.display(),
            self.max_size_mb
        )
    }

    /// Write the project's stanza. Failures are logged, never returned.
    pub async fn setup(&self, project_id: &str) -> bool {
        let path = self.config_path(project_id);
        let result = async {
            tokio::fs::create_dir_all(&self.config_dir).await?;
            tokio::fs::write(&path, self.render(project_id)).await
        }
        .await;
        match result {
            Ok(()) => {
                debug!(project = project_id, path = %path.display(), "log rotation configured");
                true
            }
            Err(e) => {
                error!(project = project_id, error = %e, "failed to set up log rotation");
                false
            }
        }
    }

    pub async fn remove(&self, project_id: &str) -> bool {
        let path = self.config_path(project_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(project = project_id, "log rotation removed");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                error!(project = project_id, error = %e, "failed to remove log rotation");
                false
            }
        }
    }
}
