//! Orphaned app-server detection.
//!
//! App-server processes are recognized by their launcher signature: the Java
//! main class, or the Python app-server script as `argv[1]`. Anything that
//! does not match a signature is never touched.

use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;

use tracing::{info, warn};

use hostgrid_core::{Instance, RevisionKey, RuntimeLayout};

use crate::error::HostResult;
use crate::host::{HostProcesses, ProcessInfo};

pub struct ProcessCleanup {
    host: Arc<dyn HostProcesses>,
    layout: RuntimeLayout,
}

impl ProcessCleanup {
    pub fn new(host: Arc<dyn HostProcesses>, layout: RuntimeLayout) -> Self {
        Self { host, layout }
    }

    /// Work out which instance a process serves, if it is an app server.
    pub fn identify(&self, process: &ProcessInfo) -> Option<Instance> {
        let cmd = &process.cmdline;
        if cmd.len() < 2 {
            return None;
        }

        if cmd.iter().any(|arg| arg == &self.layout.java_main_class) {
            let port = cmd
                .iter()
                .find_map(|arg| arg.strip_prefix("--port="))?
                .parse()
                .ok()?;
            let revision_key = self.revision_in(cmd.last()?)?;
            Some(Instance::new(revision_key, port))
        } else if Path::new(&cmd[1]) == self.layout.python_appserver.as_path() {
            let port_idx = cmd.iter().position(|arg| arg == "--port")?;
            let port = cmd.get(port_idx + 1)?.parse().ok()?;
            let revision_key = cmd.iter().find_map(|arg| self.revision_in(arg))?;
            Some(Instance::new(revision_key, port))
        } else {
            None
        }
    }

    /// Revision whose unpack directory contains `path`.
    fn revision_in(&self, path: &str) -> Option<RevisionKey> {
        let rest = Path::new(path).strip_prefix(&self.layout.unpack_root).ok()?;
        match rest.components().next()? {
            Component::Normal(dir) => RevisionKey::from_dir_name(dir.to_str()?).ok(),
            _ => None,
        }
    }

    /// Kill every app-server process whose instance is not in `expected`.
    /// Returns the number of processes killed.
    pub async fn clean_up_instances(&self, expected: &HashSet<Instance>) -> HostResult<usize> {
        let processes = self.host.list().await?;
        let orphans: Vec<(ProcessInfo, Instance)> = processes
            .into_iter()
            .filter_map(|process| {
                let instance = self.identify(&process)?;
                (!expected.contains(&instance)).then_some((process, instance))
            })
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }

        let mut killed = 0;
        for (process, instance) in &orphans {
            warn!(pid = process.pid, %instance, "killing unmonitored instance");
            match self.host.kill_group(process.pid).await {
                Ok(()) => killed += 1,
                Err(e) => warn!(pid = process.pid, error = %e, "failed to kill unmonitored instance"),
            }
        }
        info!(killed, found = orphans.len(), "cleaned up unmonitored instances");
        Ok(killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use hostgrid_core::VersionKey;

    struct StaticHost {
        processes: Vec<ProcessInfo>,
        killed: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl HostProcesses for StaticHost {
        async fn list(&self) -> HostResult<Vec<ProcessInfo>> {
            Ok(self.processes.clone())
        }

        async fn kill_group(&self, pid: u32) -> HostResult<()> {
            self.killed.lock().await.push(pid);
            Ok(())
        }

        async fn terminate(&self, _pidfile: &Path, _grace: std::time::Duration) -> HostResult<()> {
            Ok(())
        }
    }

    fn layout() -> RuntimeLayout {
        RuntimeLayout {
            unpack_root: PathBuf::from("/opt/hostgrid/apps"),
            python_appserver: PathBuf::from("/opt/rt/dev_appserver.py"),
            java_main_class: "com.example.DevAppServerMain".to_string(),
            ..RuntimeLayout::default()
        }
    }

    fn python(pid: u32, rev: &str, port: u16) -> ProcessInfo {
        ProcessInfo {
            pid,
            cmdline: vec![
                "/usr/bin/python2".into(),
                "/opt/rt/dev_appserver.py".into(),
                "--port".into(),
                port.to_string(),
                format!("/opt/hostgrid/apps/{rev}/app/app.yaml"),
            ],
        }
    }

    fn java(pid: u32, rev: &str, port: u16) -> ProcessInfo {
        ProcessInfo {
            pid,
            cmdline: vec![
                "java".into(),
                "-Xmx150m".into(),
                "com.example.DevAppServerMain".into(),
                format!("--port={port}"),
                format!("/opt/hostgrid/apps/{rev}/app"),
            ],
        }
    }

    fn rev(n: u64) -> RevisionKey {
        let key: VersionKey = "app/default/v1".parse().unwrap();
        key.revision(n)
    }

    #[test]
    fn identifies_both_runtime_families() {
        let cleanup = ProcessCleanup::new(
            Arc::new(StaticHost {
                processes: vec![],
                killed: Mutex::new(vec![]),
            }),
            layout(),
        );
        assert_eq!(
            cleanup.identify(&python(1, "app_default_v1_1", 20000)),
            Some(Instance::new(rev(1), 20000))
        );
        assert_eq!(
            cleanup.identify(&java(2, "app_default_v1_2", 20001)),
            Some(Instance::new(rev(2), 20001))
        );
        let unrelated = ProcessInfo {
            pid: 3,
            cmdline: vec!["/usr/bin/python2".into(), "server.py".into(), "--port".into(), "20000".into()],
        };
        assert_eq!(cleanup.identify(&unrelated), None);
    }

    #[tokio::test]
    async fn kills_exactly_the_unexpected_matches() {
        let host = Arc::new(StaticHost {
            processes: vec![
                python(10, "app_default_v1_1", 20000),
                python(11, "app_default_v1_1", 20001),
                java(12, "app_default_v1_2", 20000),
                ProcessInfo {
                    pid: 13,
                    cmdline: vec!["nginx".into(), "-g".into()],
                },
            ],
            killed: Mutex::new(vec![]),
        });
        let cleanup = ProcessCleanup::new(host.clone(), layout());

        let expected = HashSet::from([Instance::new(rev(1), 20000)]);
        let killed = cleanup.clean_up_instances(&expected).await.unwrap();

        assert_eq!(killed, 2);
        let mut pids = host.killed.lock().await.clone();
        pids.sort();
        assert_eq!(pids, vec![11, 12]);
    }
}
