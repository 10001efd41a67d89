//! jobd daemon library exports.
//!
//! This crate provides the `jobd` binary: the CLI, the daemon lifecycle and
//! everything that runs inside the daemon process.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, stop, status, job, workflow)
//! - `daemon`: Lifecycle, single-instance enforcement and the shared context
//! - `server`: Control-socket request handling
//! - `dispatcher`: Job process spawning and supervision
//! - `policy`: Command policy checked before every spawn
//! - `logging`: Tracing setup and the rotating log file

pub mod cli;
pub mod commands;
pub mod daemon;
pub mod dispatcher;
pub mod jobs;
pub mod logging;
pub mod policy;
pub mod server;

pub use cli::{Cli, Commands, JobCommands, WorkflowCommands};
pub use commands::{
    handle_job, handle_workflow, load_settings, restart_daemon, show_status, start_daemon,
    stop_daemon,
};
pub use daemon::{ControlRequest, Daemon};
pub use dispatcher::{Dispatcher, JobEvent};
pub use jobs::JobError;
pub use policy::CommandPolicy;
