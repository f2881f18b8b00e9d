//! Configuration loading from isocell.toml
//!
//! isocell configuration can be specified in an `isocell.toml` file in the project root.
//! The configuration is automatically discovered by walking up from the current directory.

use crate::planner::DefaultGrouping;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the configuration file looked up by `discover`
pub const CONFIG_FILE: &str = "isocell.toml";

/// Errors raised while loading or resolving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for `IsocellConfig`
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        /// Parser error
        source: toml::de::Error,
    },

    /// A duration setting or flag could not be parsed
    #[error("invalid duration '{value}' for {field}: {reason}")]
    Duration {
        /// Setting or flag name
        field: &'static str,
        /// Rejected value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A value parsed but is out of range
    #[error("{0}")]
    Invalid(String),
}

/// isocell configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IsocellConfig {
    /// Isolation policy
    #[serde(default)]
    pub isolation: IsolationConfig,
    /// Worker scheduling and supervision
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Isolation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Group timeout when no member overrides it (e.g., "300s", "5m")
    #[serde(default = "default_timeout")]
    pub default_timeout: String,
    /// Forward captured output of passed tests to the report
    #[serde(default)]
    pub capture_passed_output: bool,
    /// Treat every test as isolation-marked
    #[serde(default)]
    pub isolate_all: bool,
    /// Run everything in-process, spawning no workers
    #[serde(default)]
    pub disable_isolation: bool,
    /// Group key for isolated tests without an explicit group
    #[serde(default)]
    pub default_grouping: DefaultGrouping,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            capture_passed_output: false,
            isolate_all: false,
            disable_isolation: false,
            default_grouping: DefaultGrouping::default(),
        }
    }
}

/// Worker scheduling and supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Number of groups executed concurrently
    #[serde(default)]
    pub jobs: Option<usize>,
    /// Time between SIGTERM and SIGKILL for a timed-out worker
    #[serde(default = "default_grace_period")]
    pub grace_period: String,
    /// Worker heartbeat interval ("0s" disables heartbeats)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
    /// Declare a worker hung after this long without any frame
    #[serde(default)]
    pub hang_timeout: Option<String>,
    /// Stop scheduling new groups after this many failures
    #[serde(default)]
    pub max_fail: Option<usize>,
    /// Working directory for workers
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for workers
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            grace_period: default_grace_period(),
            heartbeat_interval: default_heartbeat_interval(),
            hang_timeout: None,
            max_fail: None,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_timeout() -> String {
    "300s".to_string()
}
fn default_grace_period() -> String {
    "500ms".to_string()
}
fn default_heartbeat_interval() -> String {
    "100ms".to_string()
}

/// Fully resolved run settings
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Group timeout when no member overrides it
    pub default_timeout: Duration,
    /// Forward captured output of passed tests
    pub capture_passed_output: bool,
    /// Treat every test as isolation-marked
    pub isolate_all: bool,
    /// Run everything in-process
    pub disable_isolation: bool,
    /// Group key policy for unnamed isolated tests
    pub default_grouping: DefaultGrouping,
    /// Concurrent groups
    pub jobs: usize,
    /// SIGTERM to SIGKILL delay
    pub grace_period: Duration,
    /// Worker heartbeat interval (zero disables)
    pub heartbeat_interval: Duration,
    /// Silence limit before a worker counts as hung
    pub hang_timeout: Option<Duration>,
    /// Failure budget before scheduling stops
    pub max_fail: Option<usize>,
    /// Worker working directory
    pub working_dir: Option<PathBuf>,
    /// Extra worker environment
    pub env: Vec<(String, String)>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            capture_passed_output: false,
            isolate_all: false,
            disable_isolation: false,
            default_grouping: DefaultGrouping::default(),
            jobs: 1,
            grace_period: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(100),
            hang_timeout: None,
            max_fail: None,
            working_dir: None,
            env: Vec::new(),
        }
    }
}

impl IsocellConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Find the nearest `isocell.toml` walking up from the current directory
    pub fn find() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Discover and load configuration; a missing file yields the defaults
    pub fn discover() -> Result<Self, ConfigError> {
        match Self::find() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Resolve duration strings and defaults into run settings
    pub fn resolve(&self) -> Result<RunConfig, ConfigError> {
        let default_timeout = parse_field("default_timeout", &self.isolation.default_timeout)?;
        if default_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default_timeout must be greater than zero".to_string(),
            ));
        }

        let hang_timeout = self
            .runner
            .hang_timeout
            .as_deref()
            .map(|s| parse_field("hang_timeout", s))
            .transpose()?;

        Ok(RunConfig {
            default_timeout,
            capture_passed_output: self.isolation.capture_passed_output,
            isolate_all: self.isolation.isolate_all,
            disable_isolation: self.isolation.disable_isolation,
            default_grouping: self.isolation.default_grouping,
            jobs: self.runner.jobs.unwrap_or(1).max(1),
            grace_period: parse_field("grace_period", &self.runner.grace_period)?,
            heartbeat_interval: parse_field("heartbeat_interval", &self.runner.heartbeat_interval)?,
            hang_timeout,
            max_fail: self.runner.max_fail.filter(|&n| n > 0),
            working_dir: self.runner.working_dir.clone(),
            env: self
                .runner
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# isocell Configuration

[isolation]
# Group timeout when no test in the group sets its own
default_timeout = "300s"
# Show captured output of passed tests too (failed output is always shown)
capture_passed_output = false
# Run every test in a worker process, marked or not
isolate_all = false
# Run everything in-process; no worker is ever spawned
disable_isolation = false
# Group key for isolated tests without an explicit group:
# "per-test", "per-module" or "marker-scope"
default_grouping = "per-test"

[runner]
# Number of groups running at the same time (uncomment to enable)
# jobs = 4
# Delay between SIGTERM and SIGKILL when a group times out
grace_period = "500ms"
# Worker heartbeat interval ("0s" disables heartbeats)
heartbeat_interval = "100ms"
# Treat a worker silent for this long as hung (uncomment to enable)
# hang_timeout = "30s"
# Stop starting new groups after this many failures (uncomment to enable)
# max_fail = 1
# Working directory of worker processes (uncomment to enable)
# working_dir = "target/isocell"

[runner.env]
# Extra environment variables for worker processes
# DATABASE_URL = "postgres://localhost/test"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_part}"))?;
        if !value.is_finite() || value < 0.0 {
            return Err(format!("duration must be non-negative: {num_part}"));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(format!("unknown duration unit: {unit_part}")),
        };

        Ok(Duration::from_nanos((value * multiplier as f64) as u64))
    }
}

fn parse_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    IsocellConfig::parse_duration(value).map_err(|reason| ConfigError::Duration {
        field,
        value: value.to_string(),
        reason,
    })
}
