//! Engine configuration file.

use anyhow::Context;
use gantry_core::agent::Agent;
use gantry_runner::ExecutorConfig;
use gantry_scheduler::{EngineOptions, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for running workflows locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agents the local pool offers. Every agent runs commands on this host.
    pub agents: Vec<AgentConfig>,
    /// Cache payload directory; defaults to the platform cache dir.
    pub cache_dir: Option<PathBuf>,
    pub max_concurrent_jobs: Option<usize>,
    pub step_timeout_secs: u64,
    pub max_retry_delay_secs: u64,
    /// Kill a running step this long after cancellation. Unset lets it finish.
    pub cancel_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agents: vec![AgentConfig {
                id: "local".to_string(),
                labels: host_labels(),
            }],
            cache_dir: None,
            max_concurrent_jobs: None,
            step_timeout_secs: 30 * 60,
            max_retry_delay_secs: 60,
            cancel_grace_secs: None,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, else from the platform config file if it exists,
    /// else defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    /// Platform config file location.
    pub fn config_path() -> Option<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "gantry", "gantry")?;
        Some(dirs.config_dir().join("config.yaml"))
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .map(|a| Agent::new(a.id.clone(), a.labels.iter().cloned()))
            .collect()
    }

    pub fn engine_options(&self, workspace_root: PathBuf) -> EngineOptions {
        EngineOptions {
            executor: ExecutorConfig {
                workspace_root,
                default_step_timeout: Duration::from_secs(self.step_timeout_secs),
                max_retry_delay: Duration::from_secs(self.max_retry_delay_secs),
                cancel_grace: self.cancel_grace_secs.map(Duration::from_secs),
            },
            scheduler: SchedulerConfig {
                max_concurrent_jobs: self.max_concurrent_jobs,
            },
        }
    }
}

/// `os=` and `arch=` labels describing this host.
pub fn host_labels() -> Vec<String> {
    vec![format!("os={}", detect_os()), format!("arch={}", detect_arch())]
}

fn detect_os() -> &'static str {
    #[cfg(target_os = "linux")]
    return "linux";
    #[cfg(target_os = "macos")]
    return "macos";
    #[cfg(target_os = "windows")]
    return "windows";
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return std::env::consts::OS;
}

fn detect_arch() -> &'static str {
    std::env::consts::ARCH
}
