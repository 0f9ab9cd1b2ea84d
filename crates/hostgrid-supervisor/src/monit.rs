//! Monit-backed supervisor.
//!
//! Watch configurations are `check process` stanzas written to
//! `<config_dir>/hostgrid-<watch>.cfg`. Commands go through Monit's HTTP
//! interface, which requires a CSRF token echoed in a cookie. Reloads shell
//! out to the `monit` binary and are spaced by a cooldown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use hostgrid_core::Outcome;
use hostgrid_core::config::SupervisorConfig;

use crate::error::{SupervisorError, SupervisorResult};
use crate::traits::{ProcessSupervisor, WatchSpec, WatchState};

const CONFIG_PREFIX: &str = "hostgrid-";

pub struct MonitSupervisor {
    base_url: String,
    monit_bin: PathBuf,
    config_dir: PathBuf,
    client: reqwest::Client,
    reload_cooldown: Duration,
    /// Time of the last reload. Held across a reload so concurrent reloads queue.
    last_reload: Mutex<Option<Instant>>,
}

impl MonitSupervisor {
    pub fn new(config: &SupervisorConfig, config_dir: &Path) -> SupervisorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            monit_bin: config.monit_bin.clone(),
            config_dir: config_dir.to_path_buf(),
            client,
            reload_cooldown: config.reload_cooldown,
            last_reload: Mutex::new(None),
        })
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{CONFIG_PREFIX}{name}.cfg"))
    }

    async fn send_command(&self, name: &str, action: &str) -> SupervisorResult<Outcome> {
        validate_watch_name(name)?;
        let url = format!("{}/{name}", self.base_url);
        let token = uuid::Uuid::new_v4().to_string();

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::COOKIE, format!("securitytoken={token}"))
            .form(&[("action", action), ("securitytoken", token.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    SupervisorError::Unavailable(e.to_string())
                } else {
                    SupervisorError::Request(e)
                }
            })?;

        match response.status() {
            s if s.is_success() => {
                debug!(watch = %name, %action, "supervisor command accepted");
                Ok(Outcome::Applied)
            }
            StatusCode::NOT_FOUND => {
                info!(watch = %name, %action, "watch not known to supervisor");
                Ok(Outcome::AlreadyAbsent)
            }
            StatusCode::SERVICE_UNAVAILABLE => Err(SupervisorError::Unavailable(format!(
                "{action} {name}: 503"
            ))),
            s => Err(SupervisorError::Http {
                name: name.to_string(),
                action: action.to_string(),
                status: s.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl ProcessSupervisor for MonitSupervisor {
    async fn create_watch(&self, spec: &WatchSpec) -> SupervisorResult<()> {
        validate_watch_name(&spec.name)?;
        let stanza = render_config(spec)?;
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_path(&spec.name);
        tokio::fs::write(&path, stanza).await?;
        debug!(watch = %spec.name, path = %path.display(), "wrote watch config");
        Ok(())
    }

    async fn reload(&self) -> SupervisorResult<()> {
        let mut last = self.last_reload.lock().await;
        if let Some(at) = *last {
            let since = at.elapsed();
            if since < self.reload_cooldown {
                tokio::time::sleep(self.reload_cooldown - since).await;
            }
        }

        let status = tokio::process::Command::new(&self.monit_bin)
            .arg("reload")
            .status()
            .await
            .map_err(|e| SupervisorError::Reload(e.to_string()))?;
        *last = Some(Instant::now());

        if status.success() {
            debug!("supervisor reloaded");
            Ok(())
        } else {
            Err(SupervisorError::Reload(format!("monit reload exited with {status}")))
        }
    }

    async fn start(&self, name: &str) -> SupervisorResult<Outcome> {
        self.send_command(name, "start").await
    }

    async fn stop(&self, name: &str) -> SupervisorResult<Outcome> {
        self.send_command(name, "stop").await
    }

    async fn unmonitor(&self, name: &str) -> SupervisorResult<Outcome> {
        self.send_command(name, "unmonitor").await
    }

    async fn list_watches(&self) -> SupervisorResult<BTreeMap<String, WatchState>> {
        let url = format!("{}/_status?format=xml", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_connect() {
                SupervisorError::Unavailable(e.to_string())
            } else {
                SupervisorError::Request(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(SupervisorError::Unavailable("status: 503".to_string()));
        }
        if !status.is_success() {
            return Err(SupervisorError::Http {
                name: "_status".to_string(),
                action: "status".to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        parse_status(&body)
    }

    async fn remove_watch_config(&self, name: &str) -> SupervisorResult<()> {
        validate_watch_name(name)?;
        let path = self.config_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(watch = %name, "removed watch config");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(watch = %name, "watch config already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Watch names become URL path segments and file names.
fn validate_watch_name(name: &str) -> SupervisorResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::InvalidWatchName(name.to_string()))
    }
}

/// Map Monit's XML status document to watch states.
///
/// `monitor == 0` is unmonitored; `monitor == 1` is running when `status == 0`
/// and stopped otherwise; any other monitor value (initializing) is pending.
pub fn parse_status(xml: &str) -> SupervisorResult<BTreeMap<String, WatchState>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| SupervisorError::MalformedStatus(e.to_string()))?;

    let mut entries = BTreeMap::new();
    for service in doc.descendants().filter(|n| n.has_tag_name("service")) {
        let child = |tag: &str| {
            service
                .children()
                .find(|c| c.has_tag_name(tag))
                .and_then(|c| c.text())
                .map(str::trim)
        };

        let name = child("name")
            .ok_or_else(|| SupervisorError::MalformedStatus("service without name".into()))?;
        let number = |tag: &str| -> SupervisorResult<i64> {
            child(tag)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| SupervisorError::MalformedStatus(format!("{name}: bad {tag}")))
        };
        let monitor = number("monitor")?;
        let status = number("status")?;

        let state = match monitor {
            0 => WatchState::Unmonitored,
            1 if status == 0 => WatchState::Running,
            1 => WatchState::Stopped,
            _ => WatchState::Pending,
        };
        entries.insert(name.to_string(), state);
    }

    Ok(entries)
}

/// Render a `check process` stanza for `spec`.
pub fn render_config(spec: &WatchSpec) -> SupervisorResult<String> {
    let invalid = |reason: &str| SupervisorError::InvalidSpec {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };

    if spec.argv.is_empty() {
        return Err(invalid("empty command"));
    }
    let tokens = spec
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .chain(spec.argv.iter().cloned());
    let mut command = Vec::new();
    for token in tokens {
        if token.contains(['\'', '"', '\n']) {
            return Err(invalid("command contains quotes or newlines"));
        }
        command.push(shell_word(&token));
    }
    let command = command.join(" ");

    let pidfile = spec.pidfile.display();
    let mut start = format!("/usr/bin/env {command}");
    if let Some(log) = &spec.options.log_file {
        start.push_str(&format!(" 1>>{} 2>&1", log.display()));
    }

    let mut out = format!("check process {} with pidfile {pidfile}\n", spec.name);
    if let Some(group) = &spec.options.group {
        out.push_str(&format!("  group {group}\n"));
    }
    out.push_str(&format!("  start program = \"/bin/bash -c '{start}'\"\n"));
    out.push_str(&format!(
        "  stop program = \"/bin/bash -c 'kill -TERM $(cat {pidfile}) && rm -f {pidfile}'\"\n"
    ));
    if let Some(mb) = spec.max_memory_mb {
        let action = if spec.options.kill_exceeded_memory {
            "restart"
        } else {
            "alert"
        };
        out.push_str(&format!("  if totalmem > {mb} MB for 10 cycles then {action}\n"));
    }
    if spec.options.check_port {
        let host = spec.options.check_host.as_deref().unwrap_or("localhost");
        out.push_str(&format!(
            "  if failed host {host} port {} for 3 cycles then restart\n",
            spec.port
        ));
    }
    Ok(out)
}

fn shell_word(token: &str) -> String {
    if token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c))
    {
        token.to_string()
    } else {
        format!("\\\"{token}\\\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::WatchOptions;

    const STATUS_XML: &str = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<monit>
  <server><uptime>10</uptime></server>
  <service type="3"><name>app___guestbook_default_v1_3-20000</name><status>0</status><monitor>1</monitor></service>
  <service type="3"><name>app___guestbook_default_v1_3-20001</name><status>512</status><monitor>1</monitor></service>
  <service type="3"><name>api-server_guestbook-19999</name><status>0</status><monitor>0</monitor></service>
  <service type="3"><name>nginx</name><status>0</status><monitor>2</monitor></service>
</monit>"#;

    #[test]
    fn status_states_follow_monitor_and_status() {
        let entries = parse_status(STATUS_XML).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries["app___guestbook_default_v1_3-20000"],
            WatchState::Running
        );
        assert_eq!(
            entries["app___guestbook_default_v1_3-20001"],
            WatchState::Stopped
        );
        assert_eq!(entries["api-server_guestbook-19999"], WatchState::Unmonitored);
        assert_eq!(entries["nginx"], WatchState::Pending);
    }

    #[test]
    fn malformed_status_is_an_error() {
        assert!(matches!(
            parse_status("<monit><service>"),
            Err(SupervisorError::MalformedStatus(_))
        ));
        assert!(matches!(
            parse_status("<monit><service><name>x</name><monitor>1</monitor></service></monit>"),
            Err(SupervisorError::MalformedStatus(_))
        ));
    }

    fn spec() -> WatchSpec {
        WatchSpec {
            name: "app___guestbook_default_v1_3-20000".to_string(),
            argv: vec![
                "/usr/bin/python2".to_string(),
                "/opt/dev_appserver.py".to_string(),
                "--port".to_string(),
                "20000".to_string(),
            ],
            env: BTreeMap::from([("APPNAME".to_string(), "guestbook".to_string())]),
            pidfile: PathBuf::from("/var/run/hostgrid/app.pid"),
            port: 20000,
            max_memory_mb: Some(400),
            options: WatchOptions {
                check_port: true,
                kill_exceeded_memory: true,
                group: Some("guestbook".to_string()),
                ..WatchOptions::default()
            },
        }
    }

    #[test]
    fn rendered_config_contains_command_and_checks() {
        let cfg = render_config(&spec()).unwrap();
        assert!(cfg.starts_with(
            "check process app___guestbook_default_v1_3-20000 with pidfile /var/run/hostgrid/app.pid\n"
        ));
        assert!(cfg.contains("APPNAME=guestbook /usr/bin/python2 /opt/dev_appserver.py --port 20000"));
        assert!(cfg.contains("group guestbook"));
        assert!(cfg.contains("if totalmem > 400 MB for 10 cycles then restart"));
        assert!(cfg.contains("if failed host localhost port 20000"));
    }

    #[test]
    fn quotes_in_command_are_rejected() {
        let mut spec = spec();
        spec.argv.push("it's".to_string());
        assert!(matches!(
            render_config(&spec),
            Err(SupervisorError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn watch_names_are_restricted() {
        assert!(validate_watch_name("app___a_b_c_1-20000").is_ok());
        assert!(validate_watch_name("../etc/passwd").is_err());
        assert!(validate_watch_name("").is_err());
    }
}
