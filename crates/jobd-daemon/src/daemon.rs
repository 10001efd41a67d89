//! Daemon lifecycle and the shared context handed to the IPC server.
//!
//! [`run`] owns the process: single-instance enforcement, the PID file and
//! the restart loop. Each pass of the loop builds a fresh [`Daemon`] with
//! its store, dispatcher, scheduler and workflow engine, serves until a
//! stop/restart request, a signal or a task fault, then tears everything
//! down again.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde_json::Map;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobd_client::{DaemonClient, DaemonStatus, SchedulerStatus};
use jobd_scheduler::{
    DueJob, LegacyScheduler, MetricsSnapshot, PriorityHandle, PriorityScheduler,
    SchedulerConfig, SchedulerMetrics,
};
use jobd_store::{JobStore, Store};
use jobd_types::{Job, JobFilter, JobSpec, JobStatus, SchedulerKind, Settings};
use jobd_workflow::{EngineConfig, EngineEvent, WorkflowEngine, WorkflowError};

use crate::dispatcher::{DispatchConfig, Dispatcher, JobEvent, WorkflowLauncher};
use crate::jobs::{prepare_job, JobError};
use crate::policy::CommandPolicy;
use crate::server;

/// Requests the IPC server forwards to the lifecycle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Stop,
    Restart,
}

/// How one pass of the lifecycle loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stop,
    Restart,
}

/// Scheduler-side view used by the control plane.
pub enum SchedulerHandle {
    Priority(PriorityHandle),
    /// The legacy scheduler rescans the store every tick and needs no
    /// notifications.
    Legacy(Arc<SchedulerMetrics>),
}

impl SchedulerHandle {
    pub fn kind(&self) -> SchedulerKind {
        match self {
            SchedulerHandle::Priority(_) => SchedulerKind::Priority,
            SchedulerHandle::Legacy(_) => SchedulerKind::Legacy,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        match self {
            SchedulerHandle::Priority(handle) => handle.metrics().snapshot(),
            SchedulerHandle::Legacy(metrics) => metrics.snapshot(),
        }
    }

    pub fn job_added(&self, job: &Job) {
        if let SchedulerHandle::Priority(handle) = self {
            if job.is_recurring() {
                if let Err(e) = handle.add_job(job) {
                    warn!(job_id = %job.id, error = %e, "Failed to schedule job");
                }
            }
        }
    }

    pub fn job_removed(&self, job_id: &str) {
        if let SchedulerHandle::Priority(handle) = self {
            if let Err(e) = handle.remove_job(job_id) {
                warn!(job_id, error = %e, "Failed to unschedule job");
            }
        }
    }

    pub fn job_finished(&self, job_id: &str) {
        if let SchedulerHandle::Priority(handle) = self {
            if let Err(e) = handle.job_finished(job_id) {
                debug!(job_id, error = %e, "Scheduler not notified of completion");
            }
        }
    }
}

/// Everything a request handler can reach. Built once per lifecycle pass.
pub struct Daemon {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: SchedulerHandle,
    pub engine: Arc<WorkflowEngine>,
    pub policy: CommandPolicy,
    pub started_at: DateTime<Utc>,
    pub restarts: u32,
    control: mpsc::UnboundedSender<ControlRequest>,
}

impl Daemon {
    /// Ask the lifecycle loop to stop or restart. The caller's reply is
    /// sent before teardown begins.
    pub fn request(&self, request: ControlRequest) {
        if self.control.send(request).is_err() {
            warn!(?request, "Lifecycle loop is gone");
        }
    }

    pub fn add_job(&self, spec: JobSpec) -> Result<Job, JobError> {
        let job = prepare_job(spec, &self.policy, Utc::now())?;
        let job = self.store.create(job)?;
        self.scheduler.job_added(&job);
        info!(job_id = %job.id, name = %job.name, "Job added");
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Job, JobError> {
        self.store
            .get(id)?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list(filter)?)
    }

    pub fn start_job(&self, id: &str) -> Result<Job, JobError> {
        self.dispatcher.start(id)
    }

    pub fn stop_job(&self, id: &str, signal: Option<&str>) -> Result<Job, JobError> {
        self.dispatcher.stop(id, signal)
    }

    /// Keep a job from being fired by either scheduler.
    pub fn pause_job(&self, id: &str) -> Result<Job, JobError> {
        if self.dispatcher.is_running(id) {
            return Err(JobError::Running(id.to_string()));
        }
        let job = self
            .store
            .modify(id, &mut |job| Ok(job.transition(JobStatus::Paused)?))?;
        self.scheduler.job_removed(id);
        info!(job_id = %id, "Job paused");
        Ok(job)
    }

    pub fn resume_job(&self, id: &str) -> Result<Job, JobError> {
        let job = self.store.modify(id, &mut |job| {
            if job.status != JobStatus::Paused {
                return Err(jobd_types::TypesError::InvalidInput(format!(
                    "job is {}, not paused",
                    job.status
                ))
                .into());
            }
            Ok(job.transition(JobStatus::Created)?)
        })?;
        self.scheduler.job_added(&job);
        info!(job_id = %id, "Job resumed");
        Ok(job)
    }

    /// Remove a job. A running job is refused unless `force` is set, in
    /// which case its process is killed first.
    pub async fn remove_job(&self, id: &str, force: bool) -> Result<(), JobError> {
        let job = self.get_job(id)?;
        if self.dispatcher.is_running(id) || job.status == JobStatus::Running {
            if !force {
                return Err(JobError::Running(id.to_string()));
            }
            self.dispatcher.kill(id).await;
        }
        if !self.store.remove(id)? {
            return Err(JobError::NotFound(id.to_string()));
        }
        self.scheduler.job_removed(id);
        info!(job_id = %id, force, "Job removed");
        Ok(())
    }

    pub async fn status(&self) -> Result<DaemonStatus, JobError> {
        let stats = self.store.stats()?;
        let metrics = self.scheduler.metrics();
        let now = Utc::now();
        Ok(DaemonStatus {
            running: true,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            started_at: self.started_at,
            jobs: stats.jobs_by_status,
            running_processes: self.dispatcher.running_count(),
            memory_rss_bytes: resident_memory_bytes(),
            scheduler: SchedulerStatus {
                kind: self.scheduler.kind().to_string(),
                total_scheduled_jobs: metrics.total_scheduled_jobs,
                due_checks: metrics.due_checks,
                jobs_fired: metrics.jobs_fired,
                last_wake: metrics.last_wake,
            },
            active_executions: self.engine.active_executions().await,
            workflows: stats.definition_count,
            restarts: self.restarts,
        })
    }
}

/// Resident set size from `/proc/self/status`.
fn resident_memory_bytes() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

// ----------------------------------------------------------------------
// Process artifacts
// ----------------------------------------------------------------------

/// Check if a process is running
fn is_process_running(pid: u32) -> bool {
    // On Unix, sending signal 0 checks if process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Owner-only PID file, removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        fs::write(path, std::process::id().to_string()).context("Failed to write PID file")?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to restrict PID file permissions")?;
        info!(path = %path.display(), "Wrote PID file");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed PID file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove PID file"),
        }
    }
}

/// Make sure no other daemon owns our PID file and socket.
///
/// A live process that still answers `status` on the socket is a running
/// daemon and wins. A live process that does not answer is stale and is
/// terminated (SIGTERM, then SIGKILL). Dead PID files and sockets are
/// removed.
pub async fn claim_instance(pid_path: &Path, socket_path: &Path) -> Result<()> {
    if let Some(pid) = read_pid_file(pid_path) {
        if pid != std::process::id() && is_process_running(pid) {
            if answers_status(socket_path).await {
                anyhow::bail!("jobd is already running (PID {})", pid);
            }
            warn!(pid, "Terminating unresponsive daemon");
            terminate_process(pid).await;
        } else {
            info!(pid, "Removing stale PID file");
        }
        if let Err(e) = fs::remove_file(pid_path) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e).context("Failed to remove stale PID file");
            }
        }
    }

    if socket_path.exists() {
        if answers_status(socket_path).await {
            anyhow::bail!(
                "another daemon is serving {}",
                socket_path.display()
            );
        }
        info!(path = %socket_path.display(), "Removing dead socket");
        fs::remove_file(socket_path).context("Failed to remove dead socket")?;
    }
    Ok(())
}

async fn answers_status(socket_path: &Path) -> bool {
    let probe = async {
        let mut client = DaemonClient::connect(socket_path).await.ok()?;
        client.status().await.ok()
    };
    matches!(
        tokio::time::timeout(Duration::from_secs(2), probe).await,
        Ok(Some(_))
    )
}

async fn terminate_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    for _ in 0..30 {
        if !is_process_running(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

/// Bind the control socket, cleaning up and retrying once if the path is
/// taken.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!(path = %path.display(), "Socket in use, removing and retrying once");
            fs::remove_file(path).context("Failed to remove stale socket")?;
            UnixListener::bind(path).context("Failed to bind control socket")?
        }
        Err(e) => return Err(e).context("Failed to bind control socket"),
    };
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .context("Failed to restrict socket permissions")?;
    Ok(listener)
}

// ----------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------

/// Run the daemon until it is told to stop.
///
/// Faults restart the daemon in place when `auto_restart` is set, at most
/// `max_restarts` times. Requested restarts (IPC `restart`, SIGHUP) do not
/// count against that limit.
pub async fn run(settings: Settings) -> Result<()> {
    let pid_path = settings.pid_file_path();
    let socket_path = settings.socket_path();
    claim_instance(&pid_path, &socket_path).await?;
    let _pid_file = PidFile::create(&pid_path)?;

    let mut restarts = 0u32;
    let mut faults = 0u32;
    loop {
        match run_once(&settings, restarts).await {
            Ok(Exit::Stop) => {
                info!("Daemon stopped");
                return Ok(());
            }
            Ok(Exit::Restart) => {
                restarts += 1;
                info!(restarts, "Restarting daemon");
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Daemon fault");
                if !settings.auto_restart || faults >= settings.max_restarts {
                    return Err(e);
                }
                faults += 1;
                restarts += 1;
                let backoff = Duration::from_secs(u64::from(faults));
                warn!(
                    attempt = faults,
                    max_restarts = settings.max_restarts,
                    backoff_secs = backoff.as_secs(),
                    "Auto-restarting after fault"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Jobs recorded as running belong to a previous process.
fn recover_interrupted_jobs(store: &Store) -> Result<usize> {
    let running = store
        .list(&JobFilter::with_status(JobStatus::Running))
        .context("Failed to list running jobs")?;
    for job in &running {
        store
            .modify(&job.id, &mut |job| {
                job.transition(JobStatus::Failed)?;
                job.pid = None;
                job.completed_at = Some(Utc::now());
                job.last_error = Some("interrupted by daemon restart".to_string());
                Ok(())
            })
            .context("Failed to recover interrupted job")?;
        warn!(job_id = %job.id, "Marked interrupted job as failed");
    }
    Ok(running.len())
}

async fn run_once(settings: &Settings, restarts: u32) -> Result<Exit> {
    let store_path = settings.store_path();
    if let Some(parent) = store_path.parent() {
        fs::create_dir_all(parent).context("Failed to create store directory")?;
    }
    let store = Arc::new(Store::open(&store_path).context("Failed to open store")?);
    recover_interrupted_jobs(&store)?;

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<&'static str> = JoinSet::new();

    let policy = CommandPolicy::from_settings(settings);
    let (dispatcher, job_events) = Dispatcher::new(
        store.clone(),
        policy.clone(),
        DispatchConfig::from_settings(settings),
    );
    let launcher = Arc::new(WorkflowLauncher::new(dispatcher.clone(), store.clone()));
    let (engine, engine_events) =
        WorkflowEngine::new(store.clone(), launcher, EngineConfig::from_settings(settings))
            .context("Failed to start workflow engine")?;

    let (due_tx, due_rx) = mpsc::channel::<DueJob>(256);
    let scheduler_config = SchedulerConfig::from_settings(settings);
    let scheduler = match settings.scheduler {
        SchedulerKind::Priority => {
            let (scheduler, handle) = PriorityScheduler::new(store.clone(), scheduler_config)
                .context("Failed to create priority scheduler")?;
            let token = shutdown.clone();
            tasks.spawn(async move {
                scheduler.run(due_tx, token).await;
                "scheduler"
            });
            SchedulerHandle::Priority(handle)
        }
        SchedulerKind::Legacy => {
            let scheduler = LegacyScheduler::new(store.clone(), scheduler_config)
                .context("Failed to create legacy scheduler")?;
            let metrics = scheduler.metrics();
            let token = shutdown.clone();
            tasks.spawn(async move {
                scheduler.run(due_tx, token).await;
                "scheduler"
            });
            SchedulerHandle::Legacy(metrics)
        }
    };
    info!(scheduler = %settings.scheduler, "Scheduler started");

    let listener = bind_socket(&settings.socket_path())?;
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let daemon = Arc::new(Daemon {
        settings: settings.clone(),
        store: store.clone(),
        dispatcher: dispatcher.clone(),
        scheduler,
        engine: engine.clone(),
        policy,
        started_at: Utc::now(),
        restarts,
        control: control_tx,
    });

    tasks.spawn(dispatch_due_jobs(dispatcher.clone(), due_rx, shutdown.clone()));
    tasks.spawn(route_job_events(
        daemon.clone(),
        job_events,
        shutdown.clone(),
    ));
    {
        let engine = engine.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            engine.run(engine_events, token).await;
            "workflow engine"
        });
    }
    tasks.spawn(fire_scheduled_workflows(
        engine.clone(),
        SchedulerConfig::from_settings(settings),
        shutdown.clone(),
    ));
    tasks.spawn(server::serve(listener, daemon.clone(), shutdown.clone()));

    info!(
        socket = %settings.socket_path().display(),
        pid = std::process::id(),
        "jobd is ready"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let outcome = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            Ok(Exit::Stop)
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            Ok(Exit::Stop)
        }
        _ = sighup.recv() => {
            info!("Received SIGHUP, restarting...");
            Ok(Exit::Restart)
        }
        request = control_rx.recv() => match request {
            Some(ControlRequest::Restart) => Ok(Exit::Restart),
            Some(ControlRequest::Stop) | None => Ok(Exit::Stop),
        },
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok(name) => Err(anyhow::anyhow!("{} task exited unexpectedly", name)),
                Err(e) => Err(anyhow::anyhow!("daemon task panicked: {}", e)),
            }
        }
    };

    shutdown_components(settings, &daemon, &shutdown, &mut tasks).await;
    drop(daemon);
    outcome
}

async fn shutdown_components(
    settings: &Settings,
    daemon: &Daemon,
    shutdown: &CancellationToken,
    tasks: &mut JoinSet<&'static str>,
) {
    info!("Shutting down components");
    // Stops the scheduler, the engine and the IPC listener
    shutdown.cancel();

    let grace = Duration::from_secs(settings.shutdown_timeout_secs);
    daemon.dispatcher.stop_all(grace).await;

    let joined = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if joined.is_err() {
        warn!("Tasks did not finish in time, aborting");
        tasks.abort_all();
    }

    let socket_path = settings.socket_path();
    if let Err(e) = fs::remove_file(&socket_path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(error = %e, "Failed to remove control socket");
        }
    }
    if let Err(e) = daemon.store.persist() {
        error!(error = %e, "Failed to persist store on shutdown");
    }
}

async fn dispatch_due_jobs(
    dispatcher: Arc<Dispatcher>,
    mut due_rx: mpsc::Receiver<DueJob>,
    shutdown: CancellationToken,
) -> &'static str {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            due = due_rx.recv() => match due {
                Some(due) => {
                    debug!(job_id = %due.job_id, due_at = %due.due_at, "Job due");
                    dispatcher.trigger_due(&due.job_id);
                }
                None => break,
            },
        }
    }
    "due-job dispatch"
}

/// Fan job completions out to the scheduler and the workflow engine.
async fn route_job_events(
    daemon: Arc<Daemon>,
    mut events: mpsc::UnboundedReceiver<JobEvent>,
    shutdown: CancellationToken,
) -> &'static str {
    let engine_events = daemon.engine.sender();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        daemon.scheduler.job_finished(&event.job_id);
        if event.execution_id.is_some() {
            let result = event.result();
            let forwarded = engine_events.send(EngineEvent::JobFinished {
                job_id: event.job_id,
                success: event.status == JobStatus::Completed,
                error: event.error,
                result: Some(result),
            });
            if forwarded.is_err() {
                warn!("Workflow engine is gone, dropping job event");
            }
        }
    }
    "job event router"
}

/// Start workflows whose definition carries a cron `schedule`, at most once
/// per matching minute.
async fn fire_scheduled_workflows(
    engine: Arc<WorkflowEngine>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> &'static str {
    let tz = match config.parse_timezone() {
        Ok(tz) => tz,
        Err(e) => {
            error!(error = %e, "Workflow schedules disabled");
            shutdown.cancelled().await;
            return "workflow schedule";
        }
    };
    let mut last_fired: HashMap<String, i64> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(15));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Utc::now();
        let minute = now.timestamp() / 60;
        for (workflow_id, expression) in engine.scheduled_workflows().await {
            if last_fired.get(&workflow_id) == Some(&minute)
                || !jobd_scheduler::matches_in(&expression, now, tz)
            {
                continue;
            }
            last_fired.insert(workflow_id.clone(), minute);
            match engine.execute_workflow(&workflow_id, Map::new()).await {
                Ok(execution) => info!(
                    workflow_id = %workflow_id,
                    execution_id = %execution.id,
                    minute = now.minute(),
                    "Started scheduled workflow"
                ),
                Err(WorkflowError::ConcurrencyLimit { limit, .. }) => warn!(
                    workflow_id = %workflow_id,
                    limit,
                    "Skipping scheduled run, concurrency limit reached"
                ),
                Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Scheduled workflow failed to start"),
            }
        }
        last_fired.retain(|_, fired| *fired == minute);
    }
    "workflow schedule"
}
