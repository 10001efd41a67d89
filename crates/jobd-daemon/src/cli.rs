//! CLI argument parsing for jobd.
//!
//! CLI flags override all other config sources.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Job scheduling and workflow daemon
#[derive(Parser, Debug)]
#[command(name = "jobd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/jobd/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Control socket path
    #[arg(short, long, global = true)]
    pub socket: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize), logging to stderr
        #[arg(short, long)]
        foreground: bool,

        /// Scheduler implementation (priority, legacy)
        #[arg(long)]
        scheduler: Option<String>,

        /// Run in-process, logging to the log file (set when daemonizing)
        #[arg(long, hide = true)]
        detached: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Restart the running daemon in place
    Restart,

    /// Manage jobs
    #[command(subcommand)]
    Job(JobCommands),

    /// Manage workflows and their executions
    #[command(subcommand)]
    Workflow(WorkflowCommands),
}

/// Job commands
#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Add a job
    Add {
        /// Job name
        name: String,

        /// Command line (run through `sh -c` unless --exec)
        command: String,

        /// Extra argument, repeatable
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Spawn the program directly instead of through a shell
        #[arg(long)]
        exec: bool,

        /// Working directory
        #[arg(long)]
        cwd: Option<String>,

        /// Environment variable as KEY=VALUE, repeatable
        #[arg(long = "env")]
        env: Vec<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Cron expression (five fields)
        #[arg(long, conflicts_with = "every")]
        cron: Option<String>,

        /// Repeat interval in seconds
        #[arg(long)]
        every: Option<u64>,

        /// Retries after a failure
        #[arg(long, default_value_t = 0)]
        max_retries: u32,
    },

    /// List jobs
    List {
        /// Only jobs in this status, repeatable
        #[arg(long)]
        status: Vec<String>,

        /// Only jobs with a schedule
        #[arg(long)]
        scheduled: bool,

        /// Only jobs whose name contains this text
        #[arg(long)]
        name: Option<String>,
    },

    /// Show one job
    Get { id: String },

    /// Start a job now
    Start { id: String },

    /// Run a scheduled job now, outside its schedule
    Trigger { id: String },

    /// Signal a running job
    Stop {
        id: String,

        /// Signal name or number (default SIGTERM)
        #[arg(long)]
        signal: Option<String>,
    },

    /// Keep a job from being scheduled
    Pause { id: String },

    /// Make a paused job schedulable again
    Resume { id: String },

    /// Remove a job
    Remove {
        id: String,

        /// Kill the job first if it is running
        #[arg(long)]
        force: bool,
    },
}

/// Workflow commands
#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// Create a workflow from a JSON definition file
    Create { file: PathBuf },

    /// Replace a workflow definition
    Update { id: String, file: PathBuf },

    /// List workflows
    List,

    /// Show one workflow
    Get { id: String },

    /// Delete a workflow
    Delete { id: String },

    /// Start an execution
    Run {
        id: String,

        /// Parameter as KEY=VALUE (VALUE parsed as JSON when possible), repeatable
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// Show one execution
    Execution { id: String },

    /// List executions
    Executions {
        /// Only executions of this workflow
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Cancel an execution
    Cancel { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_start() {
        let cli = Cli::parse_from(["jobd", "start", "--foreground", "--scheduler", "legacy"]);
        match cli.command {
            Commands::Start {
                foreground,
                scheduler,
                detached,
            } => {
                assert!(foreground);
                assert!(!detached);
                assert_eq!(scheduler.as_deref(), Some("legacy"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::parse_from([
            "jobd",
            "--config",
            "/etc/jobd.toml",
            "status",
            "--socket",
            "/tmp/j.sock",
        ]);
        assert_eq!(cli.config.as_deref(), Some("/etc/jobd.toml"));
        assert_eq!(cli.socket.as_deref(), Some("/tmp/j.sock"));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_cli_job_add() {
        let cli = Cli::parse_from([
            "jobd", "job", "add", "backup", "tar czf /tmp/b.tgz /srv", "--cron", "0 3 * * *",
            "--env", "A=1", "--max-retries", "2",
        ]);
        match cli.command {
            Commands::Job(JobCommands::Add {
                name,
                cron,
                env,
                max_retries,
                every,
                ..
            }) => {
                assert_eq!(name, "backup");
                assert_eq!(cron.as_deref(), Some("0 3 * * *"));
                assert_eq!(env, vec!["A=1"]);
                assert_eq!(max_retries, 2);
                assert!(every.is_none());
            }
            _ => panic!("Expected job add"),
        }
    }

    #[test]
    fn test_cli_cron_and_every_conflict() {
        let result = Cli::try_parse_from([
            "jobd", "job", "add", "x", "true", "--cron", "* * * * *", "--every", "5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_job_remove_force() {
        let cli = Cli::parse_from(["jobd", "job", "remove", "01ABC", "--force"]);
        assert!(matches!(
            cli.command,
            Commands::Job(JobCommands::Remove { force: true, .. })
        ));
    }

    #[test]
    fn test_cli_workflow_run_params() {
        let cli = Cli::parse_from([
            "jobd", "workflow", "run", "wf1", "--param", "env=prod", "--param", "count=3",
        ]);
        match cli.command {
            Commands::Workflow(WorkflowCommands::Run { id, params }) => {
                assert_eq!(id, "wf1");
                assert_eq!(params, vec!["env=prod", "count=3"]);
            }
            _ => panic!("Expected workflow run"),
        }
    }
}
