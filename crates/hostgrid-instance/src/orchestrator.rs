//! Instance orchestrator — drives app-server instances through the supervisor.
//!
//! The `InstanceOrchestrator` is the control loop that:
//! - Starts instances: API server, source, watch, liveness marker, then a
//!   background health gate that registers routing once the instance answers
//! - Stops instances: routing first, then the watch and the process
//! - Rebuilds its in-memory view from the supervisor after a restart
//! - Fulfils the scheduler's assignments and repairs drift on every groom pass
//!
//! All mutating operations run under one work lock. The health gate runs
//! outside it, so a slow-starting instance never blocks other requests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hostgrid_cluster::coordination::VERSION_REGISTRATION_NODE;
use hostgrid_cluster::{CoordinationClient, RoutingClient, version_registration_path};
use hostgrid_core::{
    AgentConfig, Assignment, Instance, LaunchContext, Outcome, RevisionKey, Runtime, RuntimeLayout,
    SourceUri, VersionKey, WatchName,
};
use hostgrid_health::{HealthProber, HealthTracker};
use hostgrid_source::SourceProvider;
use hostgrid_supervisor::{ProcessSupervisor, WatchOptions, WatchSpec, WatchState};

use crate::api_server::ApiServerManager;
use crate::cleanup::ProcessCleanup;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::host::HostProcesses;
use crate::lifecycle::WatchControl;
use crate::logrotate::LogRotation;
use crate::registry::VersionRegistry;

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub coordination: Arc<dyn CoordinationClient>,
    pub routing: Arc<dyn RoutingClient>,
    pub sources: Arc<dyn SourceProvider>,
    pub registry: Arc<dyn VersionRegistry>,
    pub host: Arc<dyn HostProcesses>,
}

/// Parameters of a start request. Both fields are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub port: Option<u16>,
    pub login_server: Option<String>,
}

/// In-memory view owned by the orchestrator. Rebuilt by `recover_state`.
#[derive(Default)]
struct State {
    /// Instances that passed their health gate and are routed.
    running: HashSet<Instance>,
    /// Login server each instance was started with.
    started_with: HashMap<Instance, String>,
    login_server: Option<String>,
    assignments: Option<BTreeMap<VersionKey, Vec<Option<u16>>>>,
}

struct Inner {
    control: WatchControl,
    coordination: Arc<dyn CoordinationClient>,
    routing: Arc<dyn RoutingClient>,
    sources: Arc<dyn SourceProvider>,
    registry: Arc<dyn VersionRegistry>,
    api_servers: ApiServerManager,
    cleanup: ProcessCleanup,
    prober: HealthProber,
    logrotate: LogRotation,
    layout: RuntimeLayout,
    private_ip: String,
    default_max_memory_mb: u64,
    first_instance_port: u16,
    unhealthy_threshold: u32,
    state: Mutex<State>,
    /// Health gates still waiting on their instance.
    pending: Mutex<HashMap<Instance, JoinHandle<()>>>,
    /// Groomer health history per running instance.
    trackers: Mutex<HashMap<Instance, HealthTracker>>,
    /// Serializes every mutating operation.
    work_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct InstanceOrchestrator {
    inner: Arc<Inner>,
}

impl InstanceOrchestrator {
    pub fn new(config: &AgentConfig, collaborators: Collaborators) -> Self {
        let control = WatchControl {
            supervisor: collaborators.supervisor,
            host: collaborators.host.clone(),
            retry: config.retry.policy(),
            settle: config.supervisor.start_settle,
            stop_grace: config.instances.stop_grace,
            pid_dir: config.paths.pid_dir.clone(),
        };
        let api_servers = ApiServerManager::new(
            control.clone(),
            config.runtimes.clone(),
            config.control_plane.coordination_url.clone(),
            config.instances.api_server_port_ceiling,
            config.instances.default_max_memory_mb,
        );

        Self {
            inner: Arc::new(Inner {
                control,
                coordination: collaborators.coordination,
                routing: collaborators.routing,
                sources: collaborators.sources,
                registry: collaborators.registry,
                api_servers,
                cleanup: ProcessCleanup::new(collaborators.host, config.runtimes.clone()),
                prober: HealthProber::new(&config.health),
                logrotate: LogRotation::new(
                    &config.paths.logrotate_dir,
                    &config.paths.log_dir,
                    config.instances.max_log_size_mb,
                ),
                layout: config.runtimes.clone(),
                private_ip: config.agent.private_ip.clone(),
                default_max_memory_mb: config.instances.default_max_memory_mb,
                first_instance_port: config.instances.first_instance_port,
                unhealthy_threshold: config.health.unhealthy_threshold,
                state: Mutex::new(State::default()),
                pending: Mutex::new(HashMap::new()),
                trackers: Mutex::new(HashMap::new()),
                work_lock: Mutex::new(()),
            }),
        }
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Routed instances, sorted.
    pub async fn running_instances(&self) -> Vec<Instance> {
        let state = self.inner.state.lock().await;
        let mut running: Vec<Instance> = state.running.iter().cloned().collect();
        running.sort();
        running
    }

    /// Instances whose health gate has not finished yet.
    pub async fn pending_instances(&self) -> Vec<Instance> {
        let mut pending = self.inner.pending.lock().await;
        pending.retain(|_, handle| !handle.is_finished());
        let mut instances: Vec<Instance> = pending.keys().cloned().collect();
        instances.sort();
        instances
    }

    pub async fn api_servers(&self) -> BTreeMap<String, u16> {
        self.inner.api_servers.snapshot().await
    }

    pub fn api_server_manager(&self) -> &ApiServerManager {
        &self.inner.api_servers
    }

    pub async fn login_server(&self) -> Option<String> {
        self.inner.state.lock().await.login_server.clone()
    }

    /// Wait for every in-flight health gate to finish.
    pub async fn wait_for_pending(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.inner.pending.lock().await;
            pending.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Running plus still-probing instances.
    async fn current_instances(&self) -> HashSet<Instance> {
        let mut current = self.inner.state.lock().await.running.clone();
        current.extend(self.pending_instances().await);
        current
    }

    /// Current instances plus every monitored instance watch, including
    /// ones whose health gate gave up.
    async fn known_instances(&self) -> OrchestratorResult<HashSet<Instance>> {
        let mut known = self.current_instances().await;
        known.extend(monitored_instances(&self.list_watches().await?));
        Ok(known)
    }

    async fn list_watches(&self) -> OrchestratorResult<BTreeMap<String, WatchState>> {
        let control = &self.inner.control;
        Ok(control
            .retry
            .run("supervisor status", || control.supervisor.list_watches())
            .await?)
    }

    // ── Start ───────────────────────────────────────────────────

    /// Start one instance of `version_key`.
    ///
    /// Returns once the supervisor has started the watch. The instance is
    /// routed later, by a background health gate.
    pub async fn start_app(
        &self,
        version_key: &VersionKey,
        request: &StartRequest,
    ) -> OrchestratorResult<Instance> {
        let port = request
            .port
            .ok_or_else(|| OrchestratorError::InvalidConfiguration("port is required".into()))?;
        let login_server = request
            .login_server
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OrchestratorError::InvalidConfiguration("login_server is required".into())
            })?;

        let _work = self.inner.work_lock.lock().await;
        let current = self.inner.state.lock().await.login_server.clone();
        if let Some(current) = current.as_deref()
            && current != login_server
        {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "login_server {login_server} does not match this host's login server {current}"
            )));
        }

        let instance = self.start_locked(version_key, port, login_server).await?;
        if current.is_none() {
            info!(login_server, "login server set by start request");
            self.inner.state.lock().await.login_server = Some(login_server.to_string());
        }
        Ok(instance)
    }

    async fn start_locked(
        &self,
        version_key: &VersionKey,
        port: u16,
        login_server: &str,
    ) -> OrchestratorResult<Instance> {
        let inner = &self.inner;

        // Everything that can be rejected is checked before any side effect.
        let config = inner.registry.version(version_key).await.ok_or_else(|| {
            OrchestratorError::InvalidConfiguration(format!("version not found: {version_key}"))
        })?;
        let runtime: Runtime = config.runtime.parse()?;
        let max_memory = config.resolved_max_memory(inner.default_max_memory_mb);
        runtime.validate_memory(max_memory)?;
        SourceUri::parse(&config.source_archive_url)
            .map_err(|e| OrchestratorError::InvalidConfiguration(e.to_string()))?;
        if self.known_instances().await?.iter().any(|i| i.port == port) {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "port {port} is already in use"
            )));
        }
        let revision_key = version_key.revision(config.revision);

        let api_server_port = inner.api_servers.ensure(version_key.project_id()).await?;

        inner
            .control
            .retry
            .run("ensure source", || {
                inner
                    .sources
                    .ensure_source(&revision_key, &config.source_archive_url, runtime)
            })
            .await?;

        let watch = WatchName::instance(&revision_key, port).to_string();
        let pidfile = inner.control.pidfile(&watch);
        let command = runtime.build_command(&LaunchContext {
            revision_key: &revision_key,
            port,
            login_server,
            api_server_port,
            pidfile: &pidfile,
            private_ip: &inner.private_ip,
            max_memory_mb: max_memory,
            layout: &inner.layout,
        })?;
        let mut env = config.env_vars.clone();
        env.extend(command.env);

        let spec = WatchSpec {
            name: watch.clone(),
            argv: command.argv,
            env,
            pidfile,
            port,
            max_memory_mb: Some(max_memory),
            options: WatchOptions {
                check_port: true,
                kill_exceeded_memory: true,
                log_file: Some(inner.logrotate.log_file(&watch)),
                log_tag: Some(version_key.log_tag()),
                ..WatchOptions::default()
            },
        };

        info!(version = %version_key, revision = config.revision, port, %runtime, "starting instance");
        inner.control.start_watch(&spec).await?;

        let marker = version_registration_path(version_key);
        inner
            .control
            .retry
            .run("ensure version marker", || inner.coordination.ensure_path(&marker))
            .await
            .map_err(OrchestratorError::Coordination)?;

        let instance = Instance::new(revision_key, port);
        inner
            .state
            .lock()
            .await
            .started_with
            .insert(instance.clone(), login_server.to_string());
        self.spawn_health_gate(instance.clone()).await;

        inner.logrotate.setup(version_key.project_id()).await;
        Ok(instance)
    }

    async fn spawn_health_gate(&self, instance: Instance) {
        let this = self.clone();
        let gated = instance.clone();
        let handle = tokio::spawn(async move { this.health_gate(gated).await });
        if let Some(previous) = self.inner.pending.lock().await.insert(instance, handle) {
            previous.abort();
        }
    }

    /// Route the instance once it answers. A timeout leaves it started and
    /// unrouted for the groomer or the scheduler to deal with.
    async fn health_gate(&self, instance: Instance) {
        let inner = &self.inner;
        debug!(%instance, "waiting for instance");
        if !inner.prober.wait_until_healthy(instance.port).await {
            warn!(%instance, "instance did not come up in time, leaving it unrouted");
            return;
        }

        let registered = inner
            .control
            .retry
            .run("routing register", || inner.routing.register(&instance))
            .await;
        match registered {
            Ok(()) => {
                inner.state.lock().await.running.insert(instance.clone());
                info!(%instance, "instance is routable");
            }
            Err(e) => error!(%instance, error = %e, "failed to register instance with routing"),
        }
    }

    // ── Stop ────────────────────────────────────────────────────

    /// Stop every instance of `version_key` on this host. Idempotent.
    pub async fn stop_app(&self, version_key: &VersionKey) -> OrchestratorResult<()> {
        let _work = self.inner.work_lock.lock().await;

        let watches = self.list_watches().await?;
        let instances: Vec<Instance> = watches
            .keys()
            .filter_map(|name| match WatchName::parse(name)? {
                WatchName::Instance { revision_key, port }
                    if revision_key.version_key() == version_key =>
                {
                    Some(Instance::new(revision_key, port))
                }
                _ => None,
            })
            .collect();

        info!(version = %version_key, instances = instances.len(), "stopping version");
        let mut projects = BTreeSet::new();
        for instance in &instances {
            self.stop_instance_locked(instance).await?;
            projects.insert(instance.project_id().to_string());
        }
        self.settle_after_stop(&projects).await
    }

    /// Stop a single instance.
    pub async fn stop_instance(&self, instance: &Instance) -> OrchestratorResult<()> {
        let _work = self.inner.work_lock.lock().await;
        self.stop_instance_locked(instance).await?;
        self.settle_after_stop(&BTreeSet::from([instance.project_id().to_string()]))
            .await
    }

    async fn stop_instance_locked(&self, instance: &Instance) -> OrchestratorResult<()> {
        let inner = &self.inner;
        info!(%instance, "stopping instance");

        // A gate that is still probing must not register after this point.
        let gate = inner.pending.lock().await.remove(instance);
        if let Some(handle) = gate {
            handle.abort();
            let _ = handle.await;
        }

        let outcome = inner
            .control
            .retry
            .run("routing unregister", || inner.routing.unregister(instance))
            .await
            .map_err(OrchestratorError::Routing)?;
        if outcome == Outcome::AlreadyAbsent {
            info!(%instance, "routing did not know instance");
        }

        {
            let mut state = inner.state.lock().await;
            if !state.running.remove(instance) {
                info!(%instance, "instance was not in the running set");
            }
            state.started_with.remove(instance);
        }
        inner.trackers.lock().await.remove(instance);

        let watch = WatchName::instance(&instance.revision_key, instance.port).to_string();
        inner.control.unmonitor_and_terminate(&watch).await?;
        Ok(())
    }

    /// Release per-project resources nobody uses any more, reload once and
    /// drop stale sources.
    async fn settle_after_stop(&self, projects: &BTreeSet<String>) -> OrchestratorResult<()> {
        let inner = &self.inner;
        let watches = self.list_watches().await?;

        for project_id in projects {
            let still_running = watches.iter().any(|(name, state)| {
                state.is_monitored()
                    && WatchName::parse(name)
                        .is_some_and(|w| w.is_instance() && w.project_id() == project_id)
            });
            if still_running {
                continue;
            }
            inner.api_servers.release(project_id).await?;
            if !inner.registry.project_exists(project_id).await {
                inner.logrotate.remove(project_id).await;
            }
        }

        inner.control.reload().await?;
        self.clean_sources(&watches).await;
        Ok(())
    }

    /// Remove sources that no watch and no known version refers to.
    async fn clean_sources(&self, watches: &BTreeMap<String, WatchState>) {
        let inner = &self.inner;
        let mut active: HashSet<RevisionKey> = watches
            .keys()
            .filter_map(|name| match WatchName::parse(name)? {
                WatchName::Instance { revision_key, .. } => Some(revision_key),
                WatchName::ApiServer { .. } => None,
            })
            .collect();
        active.extend(inner.registry.revisions().await);

        if let Err(e) = inner.sources.clean_old_revisions(&active).await {
            warn!(error = %e, "failed to clean old sources");
        }
    }

    // ── Recovery ────────────────────────────────────────────────

    /// Rebuild the running set and API-server table from the supervisor.
    ///
    /// Every step is idempotent, so an interrupted recovery is repaired by
    /// the next one.
    pub async fn recover_state(&self) -> OrchestratorResult<HashSet<Instance>> {
        let _work = self.inner.work_lock.lock().await;
        let inner = &self.inner;
        info!("recovering state from supervisor");

        let mut watches = self.list_watches().await?;

        // Unmonitored watches of ours are leftovers; drop them.
        let unmonitored: Vec<String> = watches
            .iter()
            .filter(|(name, state)| !state.is_monitored() && WatchName::parse(name).is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &unmonitored {
            inner.control.supervisor.remove_watch_config(name).await?;
            watches.remove(name);
            info!(watch = %name, "removed unmonitored watch");
        }
        if !unmonitored.is_empty() {
            inner.control.reload().await?;
        }

        let instances = monitored_instances(&watches);
        inner.cleanup.clean_up_instances(&instances).await?;

        let versions: BTreeSet<&VersionKey> = instances.iter().map(|i| i.version_key()).collect();
        let mut markers = vec![VERSION_REGISTRATION_NODE.to_string()];
        markers.extend(versions.into_iter().map(version_registration_path));
        for marker in &markers {
            inner
                .control
                .retry
                .run("ensure version marker", || inner.coordination.ensure_path(marker))
                .await
                .map_err(OrchestratorError::Coordination)?;
        }

        inner
            .control
            .retry
            .run("routing declare", || inner.routing.declare_known(&instances))
            .await
            .map_err(OrchestratorError::Routing)?;

        for (_, handle) in inner.pending.lock().await.drain() {
            handle.abort();
        }
        inner.trackers.lock().await.clear();
        {
            let mut state = inner.state.lock().await;
            state.running = instances.clone();
            state.started_with.clear();
        }

        inner.api_servers.populate(&watches).await;

        info!(instances = instances.len(), "state recovered");
        Ok(instances)
    }

    // ── Repair ──────────────────────────────────────────────────

    /// Restart instances the routing layer reports as failed.
    pub async fn stop_failed_instances(&self) -> OrchestratorResult<usize> {
        let _work = self.inner.work_lock.lock().await;
        self.stop_failed_locked().await
    }

    async fn stop_failed_locked(&self) -> OrchestratorResult<usize> {
        let inner = &self.inner;
        let failed = inner
            .control
            .retry
            .run("routing failed instances", || inner.routing.get_failed_instances())
            .await
            .map_err(OrchestratorError::Routing)?;
        if failed.is_empty() {
            return Ok(0);
        }

        let running = inner.state.lock().await.running.clone();
        let mut matched: Vec<Instance> = running
            .into_iter()
            .filter(|i| failed.contains(&(i.version_key().clone(), i.port)))
            .collect();
        matched.sort();

        let mut stale: Vec<&(VersionKey, u16)> = failed
            .iter()
            .filter(|(version_key, port)| {
                !matched
                    .iter()
                    .any(|i| i.version_key() == version_key && i.port == *port)
            })
            .collect();
        stale.sort();
        for (version_key, port) in stale {
            self.unregister_stale_route(version_key, *port).await?;
        }

        for instance in &matched {
            warn!(%instance, "routing reports instance failed, restarting");
            self.replace_instance(instance).await?;
        }
        Ok(matched.len())
    }

    /// Drop a failed route entry for a port this host has no record of.
    async fn unregister_stale_route(
        &self,
        version_key: &VersionKey,
        port: u16,
    ) -> OrchestratorResult<()> {
        let inner = &self.inner;
        let known = self
            .known_instances()
            .await?
            .into_iter()
            .find(|i| i.version_key() == version_key && i.port == port);
        let instance = match known {
            Some(instance) => instance,
            None => match inner.registry.version(version_key).await {
                Some(config) => Instance::new(version_key.revision(config.revision), port),
                None => {
                    debug!(version = %version_key, port, "failed route for an unknown version");
                    return Ok(());
                }
            },
        };

        info!(%instance, "unregistering failed route with no local instance");
        inner
            .control
            .retry
            .run("routing unregister", || inner.routing.unregister(&instance))
            .await
            .map_err(OrchestratorError::Routing)?;
        Ok(())
    }

    /// Probe every running instance and restart the ones that stayed
    /// unhealthy for `unhealthy_threshold` consecutive probes.
    pub async fn restart_unavailable_instances(&self) -> OrchestratorResult<usize> {
        let _work = self.inner.work_lock.lock().await;
        self.restart_unavailable_locked().await
    }

    async fn restart_unavailable_locked(&self) -> OrchestratorResult<usize> {
        let inner = &self.inner;
        let running = self.running_instances().await;

        let mut unhealthy = Vec::new();
        for instance in &running {
            let result = inner.prober.probe(instance.port).await;
            let mut trackers = inner.trackers.lock().await;
            let tracker = trackers
                .entry(instance.clone())
                .or_insert_with(|| HealthTracker::new(inner.unhealthy_threshold));
            if tracker.record(result) {
                unhealthy.push(instance.clone());
            }
        }
        inner
            .trackers
            .lock()
            .await
            .retain(|instance, _| running.contains(instance));

        let mut restarted = 0;
        for instance in &unhealthy {
            if inner.registry.version(instance.version_key()).await.is_none() {
                continue;
            }
            warn!(%instance, "instance keeps failing health checks, restarting");
            self.replace_instance(instance).await?;
            restarted += 1;
        }
        Ok(restarted)
    }

    /// Stop `instance` and start its version again on the same port, when
    /// the version is still known and a login server is available.
    async fn replace_instance(&self, instance: &Instance) -> OrchestratorResult<()> {
        let login_server = {
            let state = self.inner.state.lock().await;
            state
                .login_server
                .clone()
                .or_else(|| state.started_with.get(instance).cloned())
        };
        self.stop_instance_locked(instance).await?;

        let config = self.inner.registry.version(instance.version_key()).await;
        let login_server = match &config {
            Some(config) => login_server.or_else(|| config.login_server.clone()),
            None => None,
        };
        match login_server {
            Some(login_server) => {
                self.start_locked(instance.version_key(), instance.port, &login_server)
                    .await?;
            }
            None => {
                debug!(%instance, "not restarting instance");
                self.settle_after_stop(&BTreeSet::from([instance.project_id().to_string()]))
                    .await?;
            }
        }
        Ok(())
    }

    /// Restart instances running an outdated revision or started with a
    /// different login server than the current one.
    pub async fn enforce_instance_details(&self) -> OrchestratorResult<usize> {
        let _work = self.inner.work_lock.lock().await;
        self.enforce_locked().await
    }

    async fn enforce_locked(&self) -> OrchestratorResult<usize> {
        let inner = &self.inner;
        let (started_with, login_server) = {
            let state = inner.state.lock().await;
            (state.started_with.clone(), state.login_server.clone())
        };

        let mut restarted = 0;
        for instance in self.running_instances().await {
            let Some(config) = inner.registry.version(instance.version_key()).await else {
                continue;
            };
            let outdated = instance.revision_key.revision() != config.revision;
            let login_changed = matches!(
                (started_with.get(&instance), &login_server),
                (Some(started), Some(current)) if started != current
            );
            if outdated || login_changed {
                info!(%instance, outdated, login_changed, "configuration changed, restarting");
                self.replace_instance(&instance).await?;
                restarted += 1;
            }
        }
        Ok(restarted)
    }

    // ── Assignments ─────────────────────────────────────────────

    /// Record the scheduler's desired state for this host and act on it.
    pub async fn apply_assignments(
        &self,
        login_server: &str,
        assignments: Vec<Assignment>,
    ) -> OrchestratorResult<()> {
        if login_server.is_empty() {
            return Err(OrchestratorError::InvalidConfiguration(
                "login_server is required".into(),
            ));
        }
        let desired: BTreeMap<VersionKey, Vec<Option<u16>>> = assignments
            .into_iter()
            .map(|a| (a.version_key, a.ports))
            .collect();

        let _work = self.inner.work_lock.lock().await;
        let login_changed = {
            let mut state = self.inner.state.lock().await;
            let changed = state.login_server.as_deref() != Some(login_server);
            if changed {
                info!(login_server, "new login server");
                state.login_server = Some(login_server.to_string());
            }
            if state.assignments.as_ref() != Some(&desired) {
                info!(versions = desired.len(), "new assignments");
            }
            state.assignments = Some(desired);
            changed
        };

        self.fulfill_locked().await?;
        if login_changed {
            self.enforce_locked().await?;
        }
        Ok(())
    }

    /// Start and stop instances until they match the recorded assignments.
    pub async fn fulfill_assignments(&self) -> OrchestratorResult<()> {
        let _work = self.inner.work_lock.lock().await;
        self.fulfill_locked().await
    }

    async fn fulfill_locked(&self) -> OrchestratorResult<()> {
        let inner = &self.inner;
        let (assignments, login_server) = {
            let state = inner.state.lock().await;
            (state.assignments.clone(), state.login_server.clone())
        };
        let Some(assignments) = assignments else {
            debug!("no assignments received yet");
            return Ok(());
        };

        let mut stopped_projects = BTreeSet::new();

        // Versions that are no longer assigned at all.
        let mut unassigned: Vec<Instance> = self
            .known_instances()
            .await?
            .into_iter()
            .filter(|i| !assignments.contains_key(i.version_key()))
            .collect();
        unassigned.sort();
        for instance in &unassigned {
            info!(%instance, "version is no longer assigned");
            self.stop_instance_locked(instance).await?;
            stopped_projects.insert(instance.project_id().to_string());
        }

        for (version_key, ports) in &assignments {
            let Some(config) = inner.registry.version(version_key).await else {
                debug!(version = %version_key, "assigned version is not registered yet");
                continue;
            };
            let Some(login_server) = login_server.clone().or(config.login_server) else {
                debug!(version = %version_key, "no login server known yet");
                continue;
            };

            let any_port_slots = ports.iter().filter(|p| p.is_none()).count();
            let explicit: BTreeSet<u16> = ports.iter().flatten().copied().collect();

            // Instances on unlisted ports may fill "any port" slots; the rest go.
            let mut candidates: Vec<Instance> = self
                .known_instances()
                .await?
                .into_iter()
                .filter(|i| i.version_key() == version_key && !explicit.contains(&i.port))
                .collect();
            candidates.sort_by_key(|i| i.port);
            for instance in candidates.iter().skip(any_port_slots) {
                info!(%instance, "port is no longer assigned");
                self.stop_instance_locked(instance).await?;
                stopped_projects.insert(instance.project_id().to_string());
            }

            let running_ports: BTreeSet<u16> = self
                .known_instances()
                .await?
                .iter()
                .filter(|i| i.version_key() == version_key)
                .map(|i| i.port)
                .collect();
            for &port in explicit.difference(&running_ports) {
                if let Err(e) = self.start_locked(version_key, port, &login_server).await {
                    error!(version = %version_key, port, error = %e, "failed to start assigned instance");
                }
            }

            let kept = candidates.len().min(any_port_slots);
            for _ in kept..any_port_slots {
                let port = self.lowest_free_port().await?;
                if let Err(e) = self.start_locked(version_key, port, &login_server).await {
                    error!(version = %version_key, port, error = %e, "failed to start assigned instance");
                }
            }
        }

        if !stopped_projects.is_empty() {
            self.settle_after_stop(&stopped_projects).await?;
        }
        Ok(())
    }

    async fn lowest_free_port(&self) -> OrchestratorResult<u16> {
        let used: HashSet<u16> = self.known_instances().await?.iter().map(|i| i.port).collect();
        let mut port = self.inner.first_instance_port;
        while used.contains(&port) {
            port = port.checked_add(1).ok_or_else(|| {
                OrchestratorError::InvalidConfiguration("no instance ports left".into())
            })?;
        }
        Ok(port)
    }

    // ── Grooming ────────────────────────────────────────────────

    /// Kill app-server processes that no monitored instance watch accounts for.
    pub async fn clean_up_instances(&self) -> OrchestratorResult<usize> {
        let _work = self.inner.work_lock.lock().await;
        self.clean_up_locked().await
    }

    async fn clean_up_locked(&self) -> OrchestratorResult<usize> {
        let expected = monitored_instances(&self.list_watches().await?);
        Ok(self.inner.cleanup.clean_up_instances(&expected).await?)
    }

    /// Remove sources no watch or registered version refers to.
    pub async fn clean_stale_sources(&self) -> OrchestratorResult<()> {
        let _work = self.inner.work_lock.lock().await;
        let watches = self.list_watches().await?;
        self.clean_sources(&watches).await;
        Ok(())
    }

    /// One full reconciliation pass. Each step logs its own failure and the
    /// pass moves on.
    pub async fn groom(&self) {
        let _work = self.inner.work_lock.lock().await;
        debug!("groom pass starting");

        if let Err(e) = self.stop_failed_locked().await {
            error!(error = %e, "failed to restart failed instances");
        }
        if let Err(e) = self.restart_unavailable_locked().await {
            error!(error = %e, "failed to restart unavailable instances");
        }
        if let Err(e) = self.fulfill_locked().await {
            error!(error = %e, "failed to fulfil assignments");
        }
        if let Err(e) = self.enforce_locked().await {
            error!(error = %e, "failed to enforce instance details");
        }
        if let Err(e) = self.clean_up_locked().await {
            error!(error = %e, "failed to clean up unmonitored instances");
        }
        match self.list_watches().await {
            Ok(watches) => self.clean_sources(&watches).await,
            Err(e) => error!(error = %e, "failed to list watches for source cleanup"),
        }
    }
}

/// Instances behind the monitored instance watches in `watches`.
fn monitored_instances(watches: &BTreeMap<String, WatchState>) -> HashSet<Instance> {
    watches
        .iter()
        .filter(|(_, state)| state.is_monitored())
        .filter_map(|(name, _)| match WatchName::parse(name)? {
            WatchName::Instance { revision_key, port } => Some(Instance::new(revision_key, port)),
            WatchName::ApiServer { .. } => None,
        })
        .collect()
}
