//! Command implementations for jobd.
//!
//! Handles:
//! - start: Load config, claim the instance, run the daemon (or detach)
//! - stop / restart / status: Talk to the running daemon over its socket
//! - job / workflow: Client-side control-plane commands

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use jobd_client::{DaemonClient, DaemonStatus};
use jobd_types::{JobFilter, JobSpec, JobStatus, JobType, SchedulerKind, Settings, WorkflowDefinition};

use crate::cli::{JobCommands, WorkflowCommands};
use crate::daemon::{self, read_pid_file};
use crate::logging::init_logging;

/// Load settings and apply the CLI overrides shared by every command.
pub fn load_settings(
    config_path: Option<&str>,
    socket_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(socket) = socket_override {
        settings.socket_path = socket.to_string();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Start the daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Without `--foreground`, re-launch detached and wait for the socket
/// 3. Otherwise initialize logging and run until stopped
pub async fn start_daemon(
    config_path: Option<&str>,
    socket_override: Option<&str>,
    log_level_override: Option<&str>,
    foreground: bool,
    detached: bool,
    scheduler_override: Option<&str>,
) -> Result<()> {
    let mut settings = load_settings(config_path, socket_override, log_level_override)?;
    if let Some(kind) = scheduler_override {
        settings.scheduler = kind
            .parse::<SchedulerKind>()
            .context("Invalid --scheduler")?;
    }
    settings.validate().context("Invalid configuration")?;

    if !foreground && !detached {
        return spawn_detached(config_path, socket_override, log_level_override, &settings).await;
    }

    init_logging(&settings, foreground)?;
    info!("jobd starting...");
    info!("Configuration:");
    info!("  Socket: {}", settings.socket_path().display());
    info!("  Store: {}", settings.store_path().display());
    info!("  Scheduler: {}", settings.scheduler);
    info!("  Log level: {}", settings.log_level);

    daemon::run(settings).await
}

/// Re-launch this binary in its own process group and wait until it
/// answers on the control socket.
async fn spawn_detached(
    config_path: Option<&str>,
    socket_override: Option<&str>,
    log_level_override: Option<&str>,
    settings: &Settings,
) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to locate jobd executable")?;
    let mut command = std::process::Command::new(exe);
    if let Some(config) = config_path {
        command.args(["--config", config]);
    }
    if let Some(socket) = socket_override {
        command.args(["--socket", socket]);
    }
    if let Some(level) = log_level_override {
        command.args(["--log-level", level]);
    }
    command
        .args(["start", "--detached", "--scheduler", settings.scheduler.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    let child = command.spawn().context("Failed to launch daemon process")?;

    let socket = settings.socket_path();
    for _ in 0..50 {
        if let Ok(mut client) = DaemonClient::connect(&socket).await {
            if let Ok(status) = client.status().await {
                println!("jobd started (PID {})", status.pid);
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!(
        "Daemon (PID {}) did not come up within 5s; see {}",
        child.id(),
        settings.log_file_path().display()
    )
}

async fn connect(settings: &Settings) -> Result<DaemonClient> {
    let socket = settings.socket_path();
    DaemonClient::connect(&socket)
        .await
        .with_context(|| format!("Could not reach jobd at {} - is it running?", socket.display()))
}

/// Stop the running daemon, falling back to SIGTERM via the PID file when
/// the socket does not answer.
pub async fn stop_daemon(settings: &Settings) -> Result<()> {
    if let Ok(mut client) = DaemonClient::connect(settings.socket_path()).await {
        client.stop().await.context("Failed to send stop request")?;
        println!("Stop requested");
        return Ok(());
    }

    let pid_path = settings.pid_file_path();
    let pid = read_pid_file(&pid_path).context("No PID file found - daemon may not be running")?;
    if unsafe { libc::kill(pid as i32, 0) } != 0 {
        println!("Daemon not running (stale PID file)");
        let _ = fs::remove_file(&pid_path);
        return Ok(());
    }
    info!("Stopping daemon (PID {})", pid);
    if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
        anyhow::bail!("Failed to send SIGTERM to daemon");
    }
    println!("Sent SIGTERM to daemon (PID {})", pid);
    Ok(())
}

pub async fn restart_daemon(settings: &Settings) -> Result<()> {
    let mut client = connect(settings).await?;
    client.restart().await.context("Failed to send restart request")?;
    println!("Restart requested");
    Ok(())
}

/// Show daemon status.
pub async fn show_status(settings: &Settings) -> Result<()> {
    match DaemonClient::connect(settings.socket_path()).await {
        Ok(mut client) => {
            let status = client.status().await.context("Failed to query status")?;
            print_status(&status);
        }
        Err(e) if e.is_not_running() => match read_pid_file(&settings.pid_file_path()) {
            Some(pid) => println!("jobd is NOT running (stale PID {} in {:?})", pid, settings.pid_file_path()),
            None => println!("jobd is NOT running (no PID file)"),
        },
        Err(e) => return Err(e).context("Failed to connect to daemon"),
    }
    Ok(())
}

fn print_status(status: &DaemonStatus) {
    println!("jobd is running (PID {}, v{})", status.pid, status.version);
    println!("  Uptime: {}s (since {})", status.uptime_secs, status.started_at);
    println!("  Restarts: {}", status.restarts);
    if let Some(rss) = status.memory_rss_bytes {
        println!("  Memory (RSS): {:.1} MiB", rss as f64 / (1024.0 * 1024.0));
    }
    println!("  Running processes: {}", status.running_processes);
    let counts: Vec<String> = status
        .jobs
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(s, n)| format!("{}={}", s, n))
        .collect();
    println!(
        "  Jobs: {}",
        if counts.is_empty() { "none".to_string() } else { counts.join(", ") }
    );
    println!(
        "  Workflows: {} ({} active executions)",
        status.workflows, status.active_executions
    );
    let s = &status.scheduler;
    println!(
        "  Scheduler: {} ({} scheduled, {} checks, {} fired, last wake {})",
        s.kind,
        s.total_scheduled_jobs,
        s.due_checks,
        s.jobs_fired,
        s.last_wake
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Split `KEY=VALUE`.
fn split_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        anyhow::bail!("Empty key in '{}'", raw);
    }
    Ok((key.to_string(), value.to_string()))
}

/// `--param` values: JSON when they parse, plain strings otherwise.
fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in raw {
        let (key, value) = split_pair(pair)?;
        let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
        params.insert(key, value);
    }
    Ok(params)
}

fn read_definition(file: &Path) -> Result<WorkflowDefinition> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid workflow definition in {}", file.display()))
}

/// Handle `jobd job ...`.
pub async fn handle_job(settings: &Settings, command: JobCommands) -> Result<()> {
    let mut client = connect(settings).await?;

    match command {
        JobCommands::Add {
            name,
            command,
            args,
            exec,
            cwd,
            env,
            timeout,
            cron,
            every,
            max_retries,
        } => {
            let env = env
                .iter()
                .map(|pair| split_pair(pair))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let spec = JobSpec {
                name,
                command,
                args,
                job_type: if exec { JobType::Exec } else { JobType::Shell },
                cwd,
                env,
                timeout_secs: timeout,
                cron,
                interval_secs: every,
                max_retries,
                ..Default::default()
            };
            let job = client.add_job(&spec).await?;
            println!("Added job {} ({})", job.id, job.name);
        }
        JobCommands::List {
            status,
            scheduled,
            name,
        } => {
            let statuses = status
                .iter()
                .map(|s| s.parse::<JobStatus>())
                .collect::<Result<Vec<_>, _>>()
                .context("Invalid --status")?;
            let filter = JobFilter {
                statuses: (!statuses.is_empty()).then_some(statuses),
                scheduled: scheduled.then_some(true),
                name_contains: name,
            };
            let jobs = client.list_jobs(&filter).await?;
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in jobs {
                let schedule = job
                    .schedule
                    .as_ref()
                    .map(|s| match (s.cron_expression(), s.interval()) {
                        (Some(expr), _) => format!("cron '{}'", expr),
                        (None, Some(every)) => format!("every {}s", every.as_secs()),
                        (None, None) => String::new(),
                    })
                    .unwrap_or_else(|| "manual".to_string());
                println!("{}  {:<10} {:<24} {}", job.id, job.status, job.name, schedule);
            }
        }
        JobCommands::Get { id } => print_json(&client.get_job(&id).await?)?,
        JobCommands::Start { id } => {
            let job = client.start_job(&id).await?;
            println!("Started job {} (PID {:?})", job.id, job.pid);
        }
        JobCommands::Trigger { id } => {
            let job = client.trigger_job(&id).await?;
            println!("Triggered job {} (PID {:?})", job.id, job.pid);
        }
        JobCommands::Stop { id, signal } => {
            client.stop_job(&id, signal.as_deref()).await?;
            println!("Signalled job {}", id);
        }
        JobCommands::Pause { id } => {
            client.pause_job(&id).await?;
            println!("Paused job {}", id);
        }
        JobCommands::Resume { id } => {
            client.resume_job(&id).await?;
            println!("Resumed job {}", id);
        }
        JobCommands::Remove { id, force } => {
            client.remove_job(&id, force).await?;
            println!("Removed job {}", id);
        }
    }
    Ok(())
}

/// Handle `jobd workflow ...`.
pub async fn handle_workflow(settings: &Settings, command: WorkflowCommands) -> Result<()> {
    let mut client = connect(settings).await?;

    match command {
        WorkflowCommands::Create { file } => {
            let definition = read_definition(&file)?;
            let created = client.create_workflow(&definition).await?;
            println!("Created workflow {} ({})", created.id, created.name);
        }
        WorkflowCommands::Update { id, file } => {
            let definition = read_definition(&file)?;
            let updated = client.update_workflow(&id, &definition).await?;
            println!("Updated workflow {} to version {}", updated.id, updated.version);
        }
        WorkflowCommands::List => {
            let workflows = client.list_workflows().await?;
            if workflows.is_empty() {
                println!("No workflows");
            }
            for wf in workflows {
                println!(
                    "{}  v{:<3} {:<24} {} nodes{}",
                    wf.id,
                    wf.version,
                    wf.name,
                    wf.nodes.len(),
                    wf.schedule
                        .map(|s| format!(", cron '{}'", s))
                        .unwrap_or_default()
                );
            }
        }
        WorkflowCommands::Get { id } => print_json(&client.get_workflow(&id).await?)?,
        WorkflowCommands::Delete { id } => {
            client.delete_workflow(&id).await?;
            println!("Deleted workflow {}", id);
        }
        WorkflowCommands::Run { id, params } => {
            let params = parse_params(&params)?;
            let execution = client.execute_workflow(&id, params).await?;
            println!("Started execution {} (run {})", execution.id, execution.run_id);
        }
        WorkflowCommands::Execution { id } => print_json(&client.get_execution(&id).await?)?,
        WorkflowCommands::Executions { workflow } => {
            let executions = client.list_executions(workflow.as_deref()).await?;
            if executions.is_empty() {
                println!("No executions");
            }
            for execution in executions {
                println!(
                    "{}  {:<10?} {}",
                    execution.id, execution.status, execution.run_id
                );
            }
        }
        WorkflowCommands::Cancel { id } => {
            let execution = client.cancel_execution(&id).await?;
            println!("Cancelled execution {} ({:?})", execution.id, execution.status);
        }
    }
    Ok(())
}
