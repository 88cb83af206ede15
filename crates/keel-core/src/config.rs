//! Agent configuration.
//!
//! Loaded from a YAML file (`keel.yaml` by default), then overridden from the
//! environment:
//!
//! - `KEEL_NODE_ID`
//! - `KEEL_CLUSTER_ID`
//! - `KEEL_CONTROLLER_ENDPOINT`
//! - `KEEL_STATE_DIR`

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration and plan file loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity of this node; plans for other nodes are ignored.
    #[serde(default)]
    pub node_id: String,

    #[serde(default)]
    pub cluster_id: String,

    /// Controller base URL. Empty disables status reporting.
    #[serde(default)]
    pub controller_endpoint: String,

    /// Directory holding the plan store and agent state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Root of `<service>/version` marker files.
    #[serde(default = "default_version_marker_dir")]
    pub version_marker_dir: PathBuf,

    #[serde(default = "default_plan_poll_interval_ms")]
    pub plan_poll_interval_ms: u64,

    #[serde(default = "default_plan_lock_ttl_secs")]
    pub plan_lock_ttl_secs: u64,

    /// Backoff used when a plan does not set `retry_backoff_ms`.
    #[serde(default = "default_backoff_ms")]
    pub default_backoff_ms: u64,

    #[serde(default = "default_report_timeout_ms")]
    pub report_timeout_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            cluster_id: String::new(),
            controller_endpoint: String::new(),
            state_dir: default_state_dir(),
            version_marker_dir: default_version_marker_dir(),
            plan_poll_interval_ms: default_plan_poll_interval_ms(),
            plan_lock_ttl_secs: default_plan_lock_ttl_secs(),
            default_backoff_ms: default_backoff_ms(),
            report_timeout_ms: default_report_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/keel")
}

fn default_version_marker_dir() -> PathBuf {
    PathBuf::from("/var/lib/keel/services")
}

fn default_plan_poll_interval_ms() -> u64 {
    5000
}

fn default_plan_lock_ttl_secs() -> u64 {
    30
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_report_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load from `path` when it exists, otherwise start from defaults, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            Some(p) => {
                return Err(ConfigError::Config(format!(
                    "config file {} not found",
                    p.display()
                )));
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `KEEL_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("KEEL_NODE_ID") {
            self.node_id = v;
        }
        if let Ok(v) = env::var("KEEL_CLUSTER_ID") {
            self.cluster_id = v;
        }
        if let Ok(v) = env::var("KEEL_CONTROLLER_ENDPOINT") {
            self.controller_endpoint = v;
        }
        if let Ok(v) = env::var("KEEL_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Config("node_id is required".to_string()));
        }
        if self.plan_lock_ttl_secs == 0 {
            return Err(ConfigError::Config(
                "plan_lock_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn plan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.plan_poll_interval_ms.max(1))
    }

    pub fn plan_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_lock_ttl_secs)
    }

    pub fn default_backoff(&self) -> Duration {
        Duration::from_millis(self.default_backoff_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }

    /// Directory of the JSON plan store.
    pub fn plan_store_dir(&self) -> PathBuf {
        self.state_dir.join("plans")
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}
