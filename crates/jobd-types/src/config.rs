//! Configuration loading for jobd.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/jobd/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TypesError;

/// Which scheduler implementation the daemon runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Heap keyed by next due time with adaptive wakeups (default)
    #[default]
    Priority,
    /// Fixed-tick linear scan of the job store
    Legacy,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Priority => "priority",
            SchedulerKind::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(SchedulerKind::Priority),
            "legacy" => Ok(SchedulerKind::Legacy),
            other => Err(TypesError::Config(format!("unknown scheduler '{}'", other))),
        }
    }
}

/// Main daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Control socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// PID file path
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file path (used when not running in the foreground)
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Job/workflow store snapshot file
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Rotate the log file once it grows past this many bytes
    #[serde(default = "default_max_log_size")]
    pub max_log_size_bytes: u64,

    /// Restart the daemon loop after an unhandled fault
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    /// Give up after this many consecutive automatic restarts
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Skip the dangerous-command check
    #[serde(default)]
    pub allow_dangerous_commands: bool,

    /// Longest accepted command line
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,

    /// Scheduler variant
    #[serde(default)]
    pub scheduler: SchedulerKind,

    /// Legacy scheduler tick
    #[serde(default = "default_legacy_tick_ms")]
    pub legacy_tick_ms: u64,

    /// Lower bound for the priority scheduler's wake delay
    #[serde(default = "default_min_check_interval_ms")]
    pub min_check_interval_ms: u64,

    /// Upper bound for the priority scheduler's wake delay
    #[serde(default = "default_max_check_interval_ms")]
    pub max_check_interval_ms: u64,

    /// Jobs due within this window of a wake fire on that wake
    #[serde(default = "default_due_buffer_ms")]
    pub due_buffer_ms: u64,

    /// IANA timezone used to evaluate cron expressions
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Timeout applied to jobs that do not set their own
    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,

    /// Captured stdout/stderr are truncated to this many bytes each
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Terminal workflow executions stay in memory this long
    #[serde(default = "default_execution_retention_secs")]
    pub execution_retention_secs: u64,

    /// Grace period for running jobs during shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "jobd")
}

fn runtime_dir() -> PathBuf {
    project_dirs()
        .map(|p| {
            p.runtime_dir()
                .map(|d| d.to_path_buf())
                .unwrap_or_else(|| p.cache_dir().to_path_buf())
        })
        .unwrap_or_else(|| PathBuf::from("/tmp/jobd"))
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_socket_path() -> String {
    runtime_dir().join("jobd.sock").to_string_lossy().to_string()
}

fn default_pid_file() -> String {
    runtime_dir().join("jobd.pid").to_string_lossy().to_string()
}

fn default_log_file() -> String {
    data_dir().join("jobd.log").to_string_lossy().to_string()
}

fn default_store_path() -> String {
    data_dir().join("store.json").to_string_lossy().to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_size() -> u64 {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

fn default_max_command_length() -> usize {
    4096
}

fn default_legacy_tick_ms() -> u64 {
    5_000
}

fn default_min_check_interval_ms() -> u64 {
    1_000
}

fn default_max_check_interval_ms() -> u64 {
    60_000
}

fn default_due_buffer_ms() -> u64 {
    500
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_job_timeout_secs() -> u64 {
    3_600
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_execution_retention_secs() -> u64 {
    3_600
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            store_path: default_store_path(),
            log_level: default_log_level(),
            max_log_size_bytes: default_max_log_size(),
            auto_restart: true,
            max_restarts: default_max_restarts(),
            allow_dangerous_commands: false,
            max_command_length: default_max_command_length(),
            scheduler: SchedulerKind::default(),
            legacy_tick_ms: default_legacy_tick_ms(),
            min_check_interval_ms: default_min_check_interval_ms(),
            max_check_interval_ms: default_max_check_interval_ms(),
            due_buffer_ms: default_due_buffer_ms(),
            timezone: default_timezone(),
            default_job_timeout_secs: default_job_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            execution_retention_secs: default_execution_retention_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/jobd/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (JOBD_*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = project_dirs()
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("socket_path", default_socket_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("pid_file", default_pid_file())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_file", default_log_file())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("store_path", default_store_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: JOBD_SOCKET_PATH, JOBD_AUTO_RESTART, JOBD_SCHEDULER, etc.
        // No separator: keys are flat and contain underscores themselves.
        builder = builder.add_source(Environment::with_prefix("JOBD").try_parsing(true));

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.min_check_interval_ms == 0 {
            return Err(TypesError::Config(
                "min_check_interval_ms must be > 0".to_string(),
            ));
        }
        if self.min_check_interval_ms > self.max_check_interval_ms {
            return Err(TypesError::Config(format!(
                "min_check_interval_ms ({}) exceeds max_check_interval_ms ({})",
                self.min_check_interval_ms, self.max_check_interval_ms
            )));
        }
        if self.legacy_tick_ms == 0 {
            return Err(TypesError::Config("legacy_tick_ms must be > 0".to_string()));
        }
        if self.max_command_length == 0 {
            return Err(TypesError::Config(
                "max_command_length must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        expand(&self.socket_path)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        expand(&self.pid_file)
    }

    pub fn log_file_path(&self) -> PathBuf {
        expand(&self.log_file)
    }

    pub fn store_path(&self) -> PathBuf {
        expand(&self.store_path)
    }
}

/// Expand `~` and environment variables in a configured path.
fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
