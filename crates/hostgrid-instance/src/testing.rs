//! In-memory collaborator doubles.
//!
//! Every double appends to a shared [`CallLog`] so tests can check the order
//! in which collaborators were called across all of them.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use hostgrid_cluster::{ClusterResult, CoordinationClient, RoutingClient};
use hostgrid_core::{AgentConfig, Instance, Outcome, RevisionKey, Runtime, VersionConfig, VersionKey};
use hostgrid_source::{SourceProvider, SourceResult};
use hostgrid_supervisor::{
    ProcessSupervisor, SupervisorError, SupervisorResult, WatchSpec, WatchState,
};

use crate::error::HostResult;
use crate::host::{HostProcesses, ProcessInfo};
use crate::orchestrator::{Collaborators, InstanceOrchestrator};
use crate::registry::InMemoryVersionRegistry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of collaborator calls, e.g. `"routing.unregister app/default/v1/1:20000"`.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Entries starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

// ── Supervisor ─────────────────────────────────────────────────

/// Behaves like Monit: configs take effect on reload, unknown watches are
/// reported as absent.
#[derive(Default)]
pub struct FakeSupervisor {
    log: CallLog,
    configs: Mutex<BTreeMap<String, WatchSpec>>,
    watches: Mutex<BTreeMap<String, WatchState>>,
    failing_starts: AtomicU32,
}

impl FakeSupervisor {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Seed a watch and its config as if both survived an agent restart.
    pub fn insert_watch(&self, name: &str, state: WatchState) {
        let spec = WatchSpec {
            name: name.to_string(),
            argv: Vec::new(),
            env: BTreeMap::new(),
            pidfile: PathBuf::new(),
            port: 0,
            max_memory_mb: None,
            options: Default::default(),
        };
        lock(&self.configs).insert(name.to_string(), spec);
        lock(&self.watches).insert(name.to_string(), state);
    }

    pub fn watches(&self) -> BTreeMap<String, WatchState> {
        lock(&self.watches).clone()
    }

    pub fn config(&self, name: &str) -> Option<WatchSpec> {
        lock(&self.configs).get(name).cloned()
    }

    /// Make the next `n` start calls fail as unavailable.
    pub fn fail_next_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    fn set_state(&self, name: &str, state: WatchState) -> Outcome {
        match lock(&self.watches).get_mut(name) {
            Some(current) => {
                *current = state;
                Outcome::Applied
            }
            None => Outcome::AlreadyAbsent,
        }
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn create_watch(&self, spec: &WatchSpec) -> SupervisorResult<()> {
        self.log.record(format!("supervisor.create_watch {}", spec.name));
        lock(&self.configs).insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn reload(&self) -> SupervisorResult<()> {
        self.log.record("supervisor.reload");
        let configs = lock(&self.configs);
        let mut watches = lock(&self.watches);
        watches.retain(|name, _| configs.contains_key(name));
        for name in configs.keys() {
            watches.entry(name.clone()).or_insert(WatchState::Stopped);
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> SupervisorResult<Outcome> {
        self.log.record(format!("supervisor.start {name}"));
        let failing = self.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_starts.store(failing - 1, Ordering::SeqCst);
            return Err(SupervisorError::Unavailable("fake outage".to_string()));
        }
        Ok(self.set_state(name, WatchState::Running))
    }

    async fn stop(&self, name: &str) -> SupervisorResult<Outcome> {
        self.log.record(format!("supervisor.stop {name}"));
        Ok(self.set_state(name, WatchState::Stopped))
    }

    async fn unmonitor(&self, name: &str) -> SupervisorResult<Outcome> {
        self.log.record(format!("supervisor.unmonitor {name}"));
        Ok(self.set_state(name, WatchState::Unmonitored))
    }

    async fn list_watches(&self) -> SupervisorResult<BTreeMap<String, WatchState>> {
        Ok(self.watches())
    }

    async fn remove_watch_config(&self, name: &str) -> SupervisorResult<()> {
        self.log.record(format!("supervisor.remove_watch_config {name}"));
        lock(&self.configs).remove(name);
        Ok(())
    }
}

// ── Cluster ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCoordination {
    log: CallLog,
    paths: Mutex<BTreeSet<String>>,
}

impl FakeCoordination {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            paths: Mutex::default(),
        }
    }

    pub fn paths(&self) -> BTreeSet<String> {
        lock(&self.paths).clone()
    }
}

#[async_trait]
impl CoordinationClient for FakeCoordination {
    async fn ensure_path(&self, path: &str) -> ClusterResult<()> {
        self.log.record(format!("coordination.ensure_path {path}"));
        lock(&self.paths).insert(path.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRouting {
    log: CallLog,
    registered: Mutex<HashSet<Instance>>,
    failed: Mutex<HashSet<(VersionKey, u16)>>,
    declared: Mutex<Option<HashSet<Instance>>>,
}

impl FakeRouting {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn registered(&self) -> HashSet<Instance> {
        lock(&self.registered).clone()
    }

    pub fn declared(&self) -> Option<HashSet<Instance>> {
        lock(&self.declared).clone()
    }

    pub fn mark_failed(&self, version_key: VersionKey, port: u16) {
        lock(&self.failed).insert((version_key, port));
    }
}

#[async_trait]
impl RoutingClient for FakeRouting {
    async fn register(&self, instance: &Instance) -> ClusterResult<()> {
        self.log.record(format!("routing.register {instance}"));
        lock(&self.registered).insert(instance.clone());
        Ok(())
    }

    async fn unregister(&self, instance: &Instance) -> ClusterResult<Outcome> {
        self.log.record(format!("routing.unregister {instance}"));
        lock(&self.failed).remove(&(instance.version_key().clone(), instance.port));
        if lock(&self.registered).remove(instance) {
            Ok(Outcome::Applied)
        } else {
            Ok(Outcome::AlreadyAbsent)
        }
    }

    async fn get_failed_instances(&self) -> ClusterResult<HashSet<(VersionKey, u16)>> {
        Ok(lock(&self.failed).clone())
    }

    async fn declare_known(&self, instances: &HashSet<Instance>) -> ClusterResult<()> {
        self.log.record(format!("routing.declare_known {}", instances.len()));
        *lock(&self.registered) = instances.clone();
        *lock(&self.declared) = Some(instances.clone());
        Ok(())
    }
}

// ── Sources ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSources {
    log: CallLog,
    ensured: Mutex<BTreeSet<RevisionKey>>,
    last_active: Mutex<Option<HashSet<RevisionKey>>>,
}

impl FakeSources {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn ensured(&self) -> BTreeSet<RevisionKey> {
        lock(&self.ensured).clone()
    }

    /// Active set passed to the most recent cleanup.
    pub fn last_active(&self) -> Option<HashSet<RevisionKey>> {
        lock(&self.last_active).clone()
    }
}

#[async_trait]
impl SourceProvider for FakeSources {
    async fn ensure_source(
        &self,
        revision_key: &RevisionKey,
        _source_url: &str,
        runtime: Runtime,
    ) -> SourceResult<()> {
        self.log.record(format!("sources.ensure {revision_key} {runtime}"));
        lock(&self.ensured).insert(revision_key.clone());
        Ok(())
    }

    async fn clean_old_revisions(&self, active: &HashSet<RevisionKey>) -> SourceResult<()> {
        self.log.record("sources.clean");
        lock(&self.ensured).retain(|r| active.contains(r));
        *lock(&self.last_active) = Some(active.clone());
        Ok(())
    }
}

// ── Host ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeHost {
    log: CallLog,
    processes: Mutex<Vec<ProcessInfo>>,
    killed: Mutex<Vec<u32>>,
    terminated: Mutex<Vec<PathBuf>>,
}

impl FakeHost {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn spawn(&self, process: ProcessInfo) {
        lock(&self.processes).push(process);
    }

    pub fn pids(&self) -> Vec<u32> {
        lock(&self.processes).iter().map(|p| p.pid).collect()
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.killed).clone()
    }

    pub fn terminated(&self) -> Vec<PathBuf> {
        lock(&self.terminated).clone()
    }
}

#[async_trait]
impl HostProcesses for FakeHost {
    async fn list(&self) -> HostResult<Vec<ProcessInfo>> {
        Ok(lock(&self.processes).clone())
    }

    async fn kill_group(&self, pid: u32) -> HostResult<()> {
        self.log.record(format!("host.kill_group {pid}"));
        lock(&self.processes).retain(|p| p.pid != pid);
        lock(&self.killed).push(pid);
        Ok(())
    }

    async fn terminate(&self, pidfile: &Path, _grace: Duration) -> HostResult<()> {
        self.log.record(format!("host.terminate {}", pidfile.display()));
        lock(&self.terminated).push(pidfile.to_path_buf());
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────

/// Config with short timings, writing only under `root`.
pub fn test_config(root: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.paths.pid_dir = root.join("run");
    config.paths.log_dir = root.join("log");
    config.paths.logrotate_dir = root.join("logrotate.d");
    config.paths.archive_dir = root.join("archives");
    config.paths.supervisor_config_dir = root.join("monit");
    config.runtimes.unpack_root = root.join("apps");
    config.health.host = "127.0.0.1".to_string();
    config.health.start_timeout = Duration::from_millis(300);
    config.health.interval = Duration::from_millis(20);
    config.health.request_timeout = Duration::from_millis(200);
    config.health.unhealthy_threshold = 2;
    config.retry.attempts = 3;
    config.retry.backoff = Duration::from_millis(5);
    config.supervisor.start_settle = Duration::ZERO;
    config.instances.stop_grace = Duration::from_millis(10);
    config
}

/// A registered version with a Python runtime.
pub fn python_version(revision: u64) -> VersionConfig {
    VersionConfig {
        runtime: "python27".to_string(),
        env_vars: BTreeMap::from([("APP_ENV".to_string(), "test".to_string())]),
        max_memory: None,
        instance_class: None,
        revision,
        source_archive_url: "file:///srv/archives/app.zip".to_string(),
        login_server: None,
    }
}

/// An orchestrator wired to fresh doubles that share one call log.
pub struct Harness {
    pub config: AgentConfig,
    pub log: CallLog,
    pub supervisor: Arc<FakeSupervisor>,
    pub coordination: Arc<FakeCoordination>,
    pub routing: Arc<FakeRouting>,
    pub sources: Arc<FakeSources>,
    pub registry: Arc<InMemoryVersionRegistry>,
    pub host: Arc<FakeHost>,
    pub orchestrator: InstanceOrchestrator,
}

impl Harness {
    pub fn new(root: &Path) -> Self {
        Self::with_config(test_config(root))
    }

    pub fn with_config(config: AgentConfig) -> Self {
        let log = CallLog::default();
        let supervisor = Arc::new(FakeSupervisor::new(log.clone()));
        let coordination = Arc::new(FakeCoordination::new(log.clone()));
        let routing = Arc::new(FakeRouting::new(log.clone()));
        let sources = Arc::new(FakeSources::new(log.clone()));
        let registry = Arc::new(InMemoryVersionRegistry::new());
        let host = Arc::new(FakeHost::new(log.clone()));

        let orchestrator = InstanceOrchestrator::new(
            &config,
            Collaborators {
                supervisor: supervisor.clone(),
                coordination: coordination.clone(),
                routing: routing.clone(),
                sources: sources.clone(),
                registry: registry.clone(),
                host: host.clone(),
            },
        );
        Self {
            config,
            log,
            supervisor,
            coordination,
            routing,
            sources,
            registry,
            host,
            orchestrator,
        }
    }

    /// A new orchestrator over the same doubles, as after an agent restart.
    pub fn fresh_orchestrator(&self) -> InstanceOrchestrator {
        InstanceOrchestrator::new(&self.config, self.collaborators())
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            supervisor: self.supervisor.clone(),
            coordination: self.coordination.clone(),
            routing: self.routing.clone(),
            sources: self.sources.clone(),
            registry: self.registry.clone(),
            host: self.host.clone(),
        }
    }
}
