//! hostgrid.toml agent configuration.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration for a single-node development host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::runtime::RuntimeLayout;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub paths: PathsConfig,
    pub supervisor: SupervisorConfig,
    pub health: HealthConfig,
    pub instances: InstancesConfig,
    pub retry: RetryConfig,
    pub groomer: GroomerConfig,
    pub control_plane: ControlPlaneConfig,
    pub runtimes: RuntimeLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Address app servers bind to and that is reported to the routing layer.
    pub private_ip: String,
    /// Address the scheduler-facing API listens on.
    pub listen: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            private_ip: "127.0.0.1".to_string(),
            listen: "0.0.0.0:17445".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub archive_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    pub logrotate_dir: PathBuf,
    pub supervisor_config_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("/opt/hostgrid/archives"),
            pid_dir: PathBuf::from("/var/run/hostgrid"),
            log_dir: PathBuf::from("/var/log/hostgrid"),
            logrotate_dir: PathBuf::from("/etc/logrotate.d"),
            supervisor_config_dir: PathBuf::from("/etc/monit/conf.d"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Base URL of Monit's HTTP interface.
    pub url: String,
    pub monit_bin: PathBuf,
    #[serde(with = "duration_str")]
    pub reload_cooldown: Duration,
    /// Pause between reloading and starting a freshly created watch.
    #[serde(with = "duration_str")]
    pub start_settle: Duration,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:2812".to_string(),
            monit_bin: PathBuf::from("/usr/bin/monit"),
            reload_cooldown: Duration::from_secs(1),
            start_settle: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub host: String,
    pub path: String,
    #[serde(with = "duration_str")]
    pub start_timeout: Duration,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Consecutive failed groomer probes before an instance is restarted.
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            path: "/_ah/health_check".to_string(),
            start_timeout: Duration::from_secs(180),
            interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    pub default_max_memory_mb: u64,
    /// API-server ports are handed out downward from here.
    pub api_server_port_ceiling: u16,
    /// "Any port" assignment slots are filled upward from here.
    pub first_instance_port: u16,
    #[serde(with = "duration_str")]
    pub stop_grace: Duration,
    pub max_log_size_mb: u64,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            default_max_memory_mb: 400,
            api_server_port_ceiling: 19999,
            first_instance_port: 20000,
            stop_grace: Duration::from_secs(10),
            max_log_size_mb: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde(with = "duration_str")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, self.backoff)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroomerConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for GroomerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL of the coordination store's HTTP gateway.
    pub coordination_url: String,
    /// Base URL of the routing layer's admin API.
    pub routing_url: String,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            coordination_url: "http://127.0.0.1:2380".to_string(),
            routing_url: "http://127.0.0.1:17441".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid duration: {raw:?}")))
    }
}
