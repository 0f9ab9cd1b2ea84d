//! Application runtimes and their process-start commands.
//!
//! Each runtime builds an argv and environment for one app-server process.
//! The same launcher paths are what process cleanup later matches against,
//! so [`RuntimeLayout`] is shared by both.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RevisionKey;

/// Memory reserved for the parent process, thread stacks and VM overhead
/// when computing a Java heap.
pub const JAVA_OVERHEAD_MB: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("unknown runtime: {0}")]
    UnknownRuntime(String),

    #[error("memory for Java applications must be greater than {overhead}MB (got {max_memory}MB)")]
    InsufficientMemory { max_memory: u64, overhead: u64 },
}

/// Runtime families an app server can be launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    Python27,
    Go,
    Php,
    Java,
}

impl FromStr for Runtime {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python27" => Ok(Runtime::Python27),
            "go" => Ok(Runtime::Go),
            "php" => Ok(Runtime::Php),
            "java" => Ok(Runtime::Java),
            other => Err(LaunchError::UnknownRuntime(other.to_string())),
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Runtime::Python27 => "python27",
            Runtime::Go => "go",
            Runtime::Php => "php",
            Runtime::Java => "java",
        };
        f.write_str(name)
    }
}

/// Filesystem locations of the app-server launchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLayout {
    /// Root under which each revision is unpacked into `{root}/{revision-dir}`.
    pub unpack_root: PathBuf,
    pub python_bin: PathBuf,
    /// Python dev app server script; also the cleanup signature for
    /// Python, Go and PHP instances (`argv[1]`).
    pub python_appserver: PathBuf,
    pub php_cgi: PathBuf,
    pub go_root: PathBuf,
    pub java_start_script: PathBuf,
    /// Main class that identifies Java app-server processes.
    pub java_main_class: String,
    /// Per-project API server launcher.
    pub api_server_bin: PathBuf,
}

impl Default for RuntimeLayout {
    fn default() -> Self {
        Self {
            unpack_root: PathBuf::from("/opt/hostgrid/apps"),
            python_bin: PathBuf::from("/usr/bin/python2"),
            python_appserver: PathBuf::from("/opt/hostgrid/runtimes/python27/dev_appserver.py"),
            php_cgi: PathBuf::from("/usr/bin/php-cgi"),
            go_root: PathBuf::from("/opt/go_appengine/goroot"),
            java_start_script: PathBuf::from("/opt/hostgrid/runtimes/java/bin/dev_appserver.sh"),
            java_main_class: "com.google.appengine.tools.development.DevAppServerMain".to_string(),
            api_server_bin: PathBuf::from("/opt/hostgrid/bin/api-server"),
        }
    }
}

impl RuntimeLayout {
    pub fn revision_dir(&self, revision_key: &RevisionKey) -> PathBuf {
        self.unpack_root.join(revision_key.dir_name())
    }
}

/// Inputs for building one instance's start command.
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub revision_key: &'a RevisionKey,
    pub port: u16,
    pub login_server: &'a str,
    pub api_server_port: u16,
    pub pidfile: &'a Path,
    pub private_ip: &'a str,
    pub max_memory_mb: u64,
    pub layout: &'a RuntimeLayout,
}

/// A fully built process-start command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Heap size in MB left for a Java instance with `max_memory` MB.
pub fn java_heap_mb(max_memory: u64) -> Result<u64, LaunchError> {
    match max_memory.checked_sub(JAVA_OVERHEAD_MB) {
        Some(heap) if heap > 0 => Ok(heap),
        _ => Err(LaunchError::InsufficientMemory {
            max_memory,
            overhead: JAVA_OVERHEAD_MB,
        }),
    }
}

impl Runtime {
    /// Check memory constraints without building anything.
    pub fn validate_memory(self, max_memory_mb: u64) -> Result<(), LaunchError> {
        match self {
            Runtime::Java => java_heap_mb(max_memory_mb).map(|_| ()),
            _ => Ok(()),
        }
    }

    pub fn build_command(self, ctx: &LaunchContext<'_>) -> Result<LaunchCommand, LaunchError> {
        match self {
            Runtime::Python27 | Runtime::Go | Runtime::Php => Ok(python_command(self, ctx)),
            Runtime::Java => java_command(ctx),
        }
    }
}

fn python_command(runtime: Runtime, ctx: &LaunchContext<'_>) -> LaunchCommand {
    let layout = ctx.layout;
    let revision_dir = layout.revision_dir(ctx.revision_key);
    let project_id = ctx.revision_key.project_id();
    let service_id = ctx.revision_key.version_key().service_id();
    let config_file = revision_dir.join("app").join("app.yaml");

    let argv = vec![
        layout.python_bin.display().to_string(),
        layout.python_appserver.display().to_string(),
        "--application".to_string(),
        project_id.to_string(),
        "--port".to_string(),
        ctx.port.to_string(),
        "--login_server".to_string(),
        ctx.login_server.to_string(),
        "--skip_sdk_update_check".to_string(),
        "--nginx_host".to_string(),
        ctx.login_server.to_string(),
        "--require_indexes".to_string(),
        "--enable_sendmail".to_string(),
        format!("--php_executable_path={}", layout.php_cgi.display()),
        "--max_module_instances".to_string(),
        format!("{service_id}:1"),
        "--host".to_string(),
        ctx.private_ip.to_string(),
        "--automatic_restart".to_string(),
        "no".to_string(),
        "--pidfile".to_string(),
        ctx.pidfile.display().to_string(),
        "--external_api_port".to_string(),
        ctx.api_server_port.to_string(),
        config_file.display().to_string(),
    ];

    let mut env = BTreeMap::new();
    env.insert("MY_IP_ADDRESS".to_string(), ctx.login_server.to_string());
    env.insert("APPNAME".to_string(), project_id.to_string());
    env.insert("GOMAXPROCS".to_string(), available_cpus().to_string());
    if runtime == Runtime::Go {
        env.insert(
            "GOPATH".to_string(),
            revision_dir.join("gopath").display().to_string(),
        );
        env.insert("GOROOT".to_string(), layout.go_root.display().to_string());
    }

    LaunchCommand { argv, env }
}

fn java_command(ctx: &LaunchContext<'_>) -> Result<LaunchCommand, LaunchError> {
    let layout = ctx.layout;
    let heap = java_heap_mb(ctx.max_memory_mb)?;
    let project_id = ctx.revision_key.project_id();
    let app_dir = layout.revision_dir(ctx.revision_key).join("app");

    let argv = vec![
        layout.java_start_script.display().to_string(),
        format!("--port={}", ctx.port),
        "--jvm_flag=-Dsocket.permit_connect=true".to_string(),
        format!("--jvm_flag=-Xmx{heap}m"),
        "--jvm_flag=-Djava.security.egd=file:/dev/./urandom".to_string(),
        format!("--address={}", ctx.private_ip),
        format!("--pidfile={}", ctx.pidfile.display()),
        "--disable_update_check".to_string(),
        format!("--APP_NAME={project_id}"),
        format!("--login_server={}", ctx.login_server),
        format!("--external_api_port={}", ctx.api_server_port),
        app_dir.display().to_string(),
    ];

    let mut env = BTreeMap::new();
    env.insert("APPLICATION_ID".to_string(), project_id.to_string());
    env.insert("APPNAME".to_string(), project_id.to_string());

    Ok(LaunchCommand { argv, env })
}

/// Start command for a project's API server.
pub fn api_server_command(
    layout: &RuntimeLayout,
    project_id: &str,
    port: u16,
    coordination_url: &str,
) -> LaunchCommand {
    let argv = vec![
        layout.api_server_bin.display().to_string(),
        "--port".to_string(),
        port.to_string(),
        "--project-id".to_string(),
        project_id.to_string(),
        "--coordination-url".to_string(),
        coordination_url.to_string(),
    ];
    LaunchCommand {
        argv,
        env: BTreeMap::new(),
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
