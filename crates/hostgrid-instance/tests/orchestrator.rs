//! Orchestrator behavior against in-memory collaborators and real sockets.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hostgrid_core::{Assignment, Instance, VersionConfig, VersionKey, WatchName};
use hostgrid_instance::testing::{Harness, python_version};
use hostgrid_instance::{ErrorKind, Groomer, ProcessInfo, StartRequest};
use hostgrid_supervisor::WatchState;

/// Answer every request on a fresh local port with `status`.
async fn app_server(status: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let response =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    port
}

/// A local port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn key(s: &str) -> VersionKey {
    s.parse().unwrap()
}

fn request(port: u16) -> StartRequest {
    StartRequest {
        port: Some(port),
        login_server: Some("10.0.0.1".to_string()),
    }
}

fn watch_for(instance: &Instance) -> String {
    WatchName::instance(&instance.revision_key, instance.port).to_string()
}

fn python_process(h: &Harness, pid: u32, instance: &Instance) -> ProcessInfo {
    let layout = &h.config.runtimes;
    ProcessInfo {
        pid,
        cmdline: vec![
            layout.python_bin.display().to_string(),
            layout.python_appserver.display().to_string(),
            "--port".to_string(),
            instance.port.to_string(),
            layout
                .revision_dir(&instance.revision_key)
                .join("app")
                .join("app.yaml")
                .display()
                .to_string(),
        ],
    }
}

#[tokio::test]
async fn end_to_end_start_route_stop_recover() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("v1/default/1");
    h.registry.put(version.clone(), python_version(1)).await;
    let port = app_server("200 OK").await;

    let instance = h.orchestrator.start_app(&version, &request(port)).await.unwrap();
    assert_eq!(instance, Instance::new(version.revision(1), port));
    let watch = watch_for(&instance);
    assert_eq!(h.log.matching(&format!("supervisor.create_watch {watch}")).len(), 1);
    assert_eq!(h.log.matching(&format!("supervisor.start {watch}")).len(), 1);
    assert!(h.coordination.paths().contains("/hostgrid/instances_by_version/v1_default_1"));
    assert!(h.config.paths.logrotate_dir.join("hostgrid-v1").is_file());

    h.orchestrator.wait_for_pending().await;
    assert_eq!(h.log.matching("routing.register").len(), 1);
    assert_eq!(h.routing.registered(), HashSet::from([instance.clone()]));
    assert_eq!(h.orchestrator.running_instances().await, vec![instance.clone()]);

    h.orchestrator.stop_app(&version).await.unwrap();
    let unregister = h.log.position(&format!("routing.unregister {instance}")).unwrap();
    let unmonitor = h.log.position(&format!("supervisor.unmonitor {watch}")).unwrap();
    let removed = h
        .log
        .position(&format!("supervisor.remove_watch_config {watch}"))
        .unwrap();
    assert!(unregister < unmonitor && unmonitor < removed);
    assert!(h.orchestrator.running_instances().await.is_empty());
    assert!(h.orchestrator.api_servers().await.is_empty());
    assert!(h.supervisor.watches().is_empty());

    let restarted = h.fresh_orchestrator();
    assert!(restarted.recover_state().await.unwrap().is_empty());
    assert!(restarted.running_instances().await.is_empty());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;

    h.orchestrator.stop_app(&version).await.unwrap();
    h.orchestrator.stop_app(&version).await.unwrap();

    assert!(h.supervisor.watches().is_empty());
    assert!(h.routing.registered().is_empty());
    let others: Vec<String> = h
        .log
        .entries()
        .into_iter()
        .filter(|e| e != "supervisor.reload" && e != "sources.clean")
        .collect();
    assert!(others.is_empty(), "unexpected calls: {others:?}");
}

#[tokio::test]
async fn recovery_adopts_exactly_the_monitored_watches() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let rev1 = key("app/default/v1").revision(1);
    let rev2 = key("app/default/v1").revision(2);
    let kept = Instance::new(rev1.clone(), 20000);
    let dropped = Instance::new(rev1.clone(), 20001);
    let orphan = Instance::new(rev2, 20002);

    h.supervisor.insert_watch(&watch_for(&kept), WatchState::Running);
    h.supervisor.insert_watch(&watch_for(&dropped), WatchState::Unmonitored);
    h.supervisor.insert_watch("app___not-a-revision-20003", WatchState::Running);
    h.supervisor.insert_watch("api-server_app-19999", WatchState::Running);
    h.supervisor.insert_watch("nginx", WatchState::Unmonitored);

    h.host.spawn(python_process(&h, 10, &kept));
    h.host.spawn(python_process(&h, 11, &dropped));
    h.host.spawn(python_process(&h, 12, &orphan));
    h.host.spawn(ProcessInfo {
        pid: 13,
        cmdline: vec!["/usr/sbin/sshd".to_string(), "-D".to_string()],
    });

    let recovered = h.orchestrator.recover_state().await.unwrap();

    assert_eq!(recovered, HashSet::from([kept.clone()]));
    assert_eq!(h.orchestrator.running_instances().await, vec![kept.clone()]);
    let mut killed = h.host.killed();
    killed.sort();
    assert_eq!(killed, vec![11, 12]);
    assert_eq!(h.host.pids(), vec![10, 13]);

    let watches = h.supervisor.watches();
    assert!(!watches.contains_key(&watch_for(&dropped)));
    assert!(watches.contains_key("nginx"));
    assert_eq!(h.routing.declared(), Some(HashSet::from([kept])));
    assert_eq!(
        h.orchestrator.api_servers().await,
        BTreeMap::from([("app".to_string(), 19999)])
    );
    assert!(h.coordination.paths().contains("/hostgrid/instances_by_version/app_default_v1"));

    // A second recovery changes nothing.
    let again = h.fresh_orchestrator().recover_state().await.unwrap();
    assert_eq!(again, recovered);
    assert_eq!(h.host.killed().len(), 2);
}

#[tokio::test]
async fn concurrent_ensure_starts_one_api_server() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.api_server_manager().ensure("guestbook").await
        }));
    }
    let mut ports = HashSet::new();
    for task in tasks {
        ports.insert(task.await.unwrap().unwrap());
    }

    assert_eq!(ports, HashSet::from([19999]));
    assert_eq!(h.log.matching("supervisor.create_watch api-server_").len(), 1);
    assert_eq!(
        h.supervisor.watches().get("api-server_guestbook-19999"),
        Some(&WatchState::Running)
    );

    let next = h.orchestrator.api_server_manager().ensure("other").await.unwrap();
    assert_eq!(next, 19998);
}

#[tokio::test]
async fn api_server_release_is_a_no_op_for_unknown_projects() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let manager = h.orchestrator.api_server_manager();

    assert!(!manager.release("nobody").await.unwrap().is_applied());
    manager.ensure("guestbook").await.unwrap();
    assert!(manager.release("guestbook").await.unwrap().is_applied());
    assert!(manager.snapshot().await.is_empty());
    assert!(
        h.host
            .terminated()
            .contains(&h.config.paths.pid_dir.join("api-server_guestbook-19999.pid"))
    );
}

#[tokio::test]
async fn unreachable_instance_is_never_routed() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;
    let port = closed_port().await;

    let instance = h.orchestrator.start_app(&version, &request(port)).await.unwrap();
    h.orchestrator.wait_for_pending().await;

    assert!(h.log.matching("routing.register").is_empty());
    assert!(h.orchestrator.running_instances().await.is_empty());
    assert_eq!(
        h.supervisor.watches().get(&watch_for(&instance)),
        Some(&WatchState::Running)
    );
}

#[tokio::test]
async fn stopping_during_the_health_wait_prevents_registration() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = hostgrid_instance::testing::test_config(dir.path());
    config.health.start_timeout = Duration::from_secs(30);
    let h = Harness::with_config(config);
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;

    let instance = h
        .orchestrator
        .start_app(&version, &request(closed_port().await))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.pending_instances().await, vec![instance]);

    h.orchestrator.stop_app(&version).await.unwrap();
    assert!(h.orchestrator.pending_instances().await.is_empty());
    assert!(h.log.matching("routing.register").is_empty());
}

#[tokio::test]
async fn invalid_requests_have_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");

    let missing_port = StartRequest {
        port: None,
        login_server: Some("10.0.0.1".to_string()),
    };
    let err = h.orchestrator.start_app(&version, &missing_port).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    let err = h.orchestrator.start_app(&version, &request(20000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    assert!(err.to_string().contains("version not found"));

    let java = VersionConfig {
        runtime: "java".to_string(),
        max_memory: Some(200),
        ..python_version(1)
    };
    h.registry.put(version.clone(), java).await;
    let err = h.orchestrator.start_app(&version, &request(20000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    let cobol = VersionConfig {
        runtime: "cobol".to_string(),
        ..python_version(1)
    };
    h.registry.put(version.clone(), cobol).await;
    let err = h.orchestrator.start_app(&version, &request(20000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    assert!(h.log.entries().is_empty());
    assert!(h.orchestrator.api_servers().await.is_empty());
}

#[tokio::test]
async fn occupied_port_is_rejected_even_when_unrouted() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let first = key("guestbook/default/v1");
    let second = key("ledger/default/v1");
    h.registry.put(first.clone(), python_version(1)).await;
    h.registry.put(second.clone(), python_version(1)).await;
    let port = closed_port().await;

    // The health gate gives up but the watch keeps the port.
    let instance = h.orchestrator.start_app(&first, &request(port)).await.unwrap();
    h.orchestrator.wait_for_pending().await;
    assert!(h.orchestrator.running_instances().await.is_empty());

    let err = h.orchestrator.start_app(&second, &request(port)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    assert!(err.to_string().contains("already in use"));

    let suffix = format!("-{port}");
    let on_port: Vec<String> = h
        .supervisor
        .watches()
        .into_keys()
        .filter(|name| name.starts_with("app___") && name.ends_with(&suffix))
        .collect();
    assert_eq!(on_port, vec![watch_for(&instance)]);
}

#[tokio::test]
async fn start_with_a_different_login_server_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let first = key("guestbook/default/v1");
    let second = key("ledger/default/v1");
    h.registry.put(first.clone(), python_version(1)).await;
    h.registry.put(second.clone(), python_version(1)).await;

    h.orchestrator
        .start_app(&first, &request(closed_port().await))
        .await
        .unwrap();
    h.log.clear();

    let other = StartRequest {
        port: Some(closed_port().await),
        login_server: Some("10.0.0.2".to_string()),
    };
    let err = h.orchestrator.start_app(&second, &other).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    assert!(h.log.entries().is_empty());
    assert_eq!(h.orchestrator.login_server().await.as_deref(), Some("10.0.0.1"));

    // Nothing is left for the enforcer to restart.
    assert_eq!(h.orchestrator.enforce_instance_details().await.unwrap(), 0);
    assert!(h.log.matching("supervisor.create_watch").is_empty());
}

#[tokio::test]
async fn transient_start_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;

    // Two failures fit inside the three-attempt budget.
    h.supervisor.fail_next_starts(2);
    let instance = h
        .orchestrator
        .start_app(&version, &request(closed_port().await))
        .await
        .unwrap();
    assert_eq!(
        h.supervisor.watches().get(&watch_for(&instance)),
        Some(&WatchState::Running)
    );
}

#[tokio::test]
async fn exhausted_retries_surface_as_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;

    h.supervisor.fail_next_starts(10);
    let err = h
        .orchestrator
        .start_app(&version, &request(20000))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CollaboratorUnavailable);
    assert_eq!(h.log.matching("supervisor.start").len(), 3);
}

#[tokio::test]
async fn failed_instances_are_restarted_on_the_same_port() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;
    let port = app_server("200 OK").await;

    let instance = h.orchestrator.start_app(&version, &request(port)).await.unwrap();
    h.orchestrator.wait_for_pending().await;
    h.log.clear();

    h.routing.mark_failed(version.clone(), port);
    assert_eq!(h.orchestrator.stop_failed_instances().await.unwrap(), 1);

    let unregister = h.log.position(&format!("routing.unregister {instance}")).unwrap();
    let recreate = h
        .log
        .position(&format!("supervisor.create_watch {}", watch_for(&instance)))
        .unwrap();
    assert!(unregister < recreate);

    h.orchestrator.wait_for_pending().await;
    assert_eq!(h.orchestrator.running_instances().await, vec![instance]);
    assert_eq!(h.orchestrator.stop_failed_instances().await.unwrap(), 0);
}

#[tokio::test]
async fn recovered_instances_restart_with_the_version_login_server() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    let config = VersionConfig {
        login_server: Some("10.0.0.9".to_string()),
        ..python_version(1)
    };
    h.registry.put(version.clone(), config).await;
    let instance = Instance::new(version.revision(1), closed_port().await);
    h.supervisor.insert_watch(&watch_for(&instance), WatchState::Running);
    h.host.spawn(python_process(&h, 10, &instance));

    h.orchestrator.recover_state().await.unwrap();
    assert!(h.orchestrator.login_server().await.is_none());
    h.log.clear();

    h.routing.mark_failed(version.clone(), instance.port);
    assert_eq!(h.orchestrator.stop_failed_instances().await.unwrap(), 1);
    assert_eq!(
        h.log
            .matching(&format!("supervisor.create_watch {}", watch_for(&instance)))
            .len(),
        1
    );
}

#[tokio::test]
async fn failed_routes_without_a_local_instance_are_unregistered() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;

    h.routing.mark_failed(version.clone(), 20005);
    h.routing.mark_failed(key("unknown/default/v1"), 20006);
    assert_eq!(h.orchestrator.stop_failed_instances().await.unwrap(), 0);

    let stale = Instance::new(version.revision(1), 20005);
    assert_eq!(
        h.log.matching("routing.unregister"),
        vec![format!("routing.unregister {stale}")]
    );
    assert!(h.log.matching("supervisor.create_watch").is_empty());

    // Entries for unregistered versions stay reported; nothing else repeats.
    h.log.clear();
    assert_eq!(h.orchestrator.stop_failed_instances().await.unwrap(), 0);
    assert!(h.log.entries().is_empty());
}

#[tokio::test]
async fn persistently_unavailable_instances_are_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;
    let port = app_server("503 Service Unavailable").await;

    let instance = h.orchestrator.start_app(&version, &request(port)).await.unwrap();
    h.orchestrator.wait_for_pending().await;
    assert_eq!(h.orchestrator.running_instances().await, vec![instance.clone()]);

    // Threshold is two consecutive failures.
    assert_eq!(h.orchestrator.restart_unavailable_instances().await.unwrap(), 0);
    assert_eq!(h.orchestrator.restart_unavailable_instances().await.unwrap(), 1);
    assert_eq!(h.log.matching(&format!("routing.unregister {instance}")).len(), 1);
}

#[tokio::test]
async fn new_revisions_replace_running_instances() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;
    let port = app_server("200 OK").await;

    h.orchestrator.start_app(&version, &request(port)).await.unwrap();
    h.orchestrator.wait_for_pending().await;

    h.registry.put(version.clone(), python_version(2)).await;
    assert_eq!(h.orchestrator.enforce_instance_details().await.unwrap(), 1);
    h.orchestrator.wait_for_pending().await;

    assert_eq!(
        h.orchestrator.running_instances().await,
        vec![Instance::new(version.revision(2), port)]
    );

    h.orchestrator.clean_stale_sources().await.unwrap();
    assert_eq!(
        h.sources.last_active(),
        Some(HashSet::from([version.revision(2)]))
    );
    assert!(h.sources.ensured().contains(&version.revision(2)));
    assert!(!h.sources.ensured().contains(&version.revision(1)));
}

#[tokio::test]
async fn assignments_start_and_stop_instances() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let version = key("guestbook/default/v1");
    h.registry.put(version.clone(), python_version(1)).await;
    let port = app_server("200 OK").await;

    let assignment = Assignment {
        version_key: version.clone(),
        ports: vec![Some(port), None],
    };
    h.orchestrator
        .apply_assignments("10.0.0.1", vec![assignment.clone()])
        .await
        .unwrap();
    h.orchestrator.wait_for_pending().await;

    let explicit = Instance::new(version.revision(1), port);
    let any_port = Instance::new(version.revision(1), 20000);
    let watches = h.supervisor.watches();
    assert!(watches.contains_key(&watch_for(&explicit)));
    assert!(watches.contains_key(&watch_for(&any_port)));
    assert!(h.orchestrator.running_instances().await.contains(&explicit));
    assert_eq!(h.orchestrator.login_server().await.as_deref(), Some("10.0.0.1"));

    // Re-applying the same assignment starts nothing new.
    h.log.clear();
    h.orchestrator.fulfill_assignments().await.unwrap();
    assert!(h.log.matching("supervisor.create_watch").is_empty());

    h.orchestrator.apply_assignments("10.0.0.1", vec![]).await.unwrap();
    let watches = h.supervisor.watches();
    assert!(!watches.contains_key(&watch_for(&explicit)));
    assert!(!watches.contains_key(&watch_for(&any_port)));
    assert!(h.orchestrator.api_servers().await.is_empty());
}

#[tokio::test]
async fn groomer_runs_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path());
    let (tx, rx) = tokio::sync::watch::channel(false);

    let groomer = Groomer::new(h.orchestrator.clone(), Duration::from_millis(20));
    let task = tokio::spawn(groomer.run(rx));

    tokio::time::sleep(Duration::from_millis(120)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("groomer stops on shutdown")
        .unwrap();

    assert!(!h.log.matching("sources.clean").is_empty());
}
