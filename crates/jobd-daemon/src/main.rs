//! jobd
//!
//! Job scheduling and workflow orchestration daemon.
//!
//! # Usage
//!
//! ```bash
//! jobd start [--foreground] [--socket PATH] [--scheduler priority|legacy]
//! jobd stop
//! jobd status
//! jobd restart
//! jobd job add NAME COMMAND [--cron EXPR | --every SECS]
//! jobd workflow run ID [--param KEY=VALUE]
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/jobd/config.toml)
//! 3. Environment variables (JOBD_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use jobd_daemon::{
    handle_job, handle_workflow, load_settings, restart_daemon, show_status, start_daemon,
    stop_daemon, Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let socket = cli.socket.as_deref();
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Start {
            foreground,
            scheduler,
            detached,
        } => {
            start_daemon(
                config,
                socket,
                log_level,
                foreground,
                detached,
                scheduler.as_deref(),
            )
            .await?;
        }
        Commands::Stop => {
            stop_daemon(&load_settings(config, socket, log_level)?).await?;
        }
        Commands::Status => {
            show_status(&load_settings(config, socket, log_level)?).await?;
        }
        Commands::Restart => {
            restart_daemon(&load_settings(config, socket, log_level)?).await?;
        }
        Commands::Job(command) => {
            handle_job(&load_settings(config, socket, log_level)?, command).await?;
        }
        Commands::Workflow(command) => {
            handle_workflow(&load_settings(config, socket, log_level)?, command).await?;
        }
    }

    Ok(())
}
