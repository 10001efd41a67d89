//! Job dispatcher: spawns job processes and supervises them to completion.
//!
//! Each run gets its own task that waits for the child under the job's
//! timeout, captures bounded stdout/stderr, writes the outcome back to the
//! store and emits a [`JobEvent`]. The scheduler and the workflow engine
//! learn about completions only through those events.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use jobd_store::{JobStore, StoreError};
use jobd_types::{Job, JobStatus, JobType, Settings};
use jobd_workflow::{JobLauncher, WorkflowError};

use crate::jobs::JobError;
use crate::policy::CommandPolicy;

/// A job reached a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stdout: String,
    /// Owning workflow execution, for jobs started by the engine
    pub execution_id: Option<String>,
}

impl JobEvent {
    /// Result payload handed to the workflow engine.
    pub fn result(&self) -> Value {
        json!({
            "status": self.status,
            "exit_code": self.exit_code,
            "stdout": self.stdout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Used when a job has no `timeout_secs`
    pub default_timeout: Duration,
    /// Per-stream capture limit
    pub max_output_bytes: usize,
}

impl DispatchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_timeout: Duration::from_secs(settings.default_job_timeout_secs),
            max_output_bytes: settings.max_output_bytes,
        }
    }
}

/// Why a run was interrupted from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Stop,
    Cancel,
}

/// How a run is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    /// New occurrence: retry counter starts over
    Fresh,
    /// Standalone retry after a failure
    Retry,
}

struct RunningJob {
    /// Set once the child is spawned
    pid: Option<u32>,
    stop: Option<StopReason>,
    /// Cancelled when the supervising task has finished all bookkeeping
    done: CancellationToken,
}

/// Spawns and tracks job processes.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    policy: CommandPolicy,
    config: DispatchConfig,
    running: Mutex<HashMap<String, RunningJob>>,
    events: mpsc::UnboundedSender<JobEvent>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        policy: CommandPolicy,
        config: DispatchConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            store,
            policy,
            config,
            running: Mutex::new(HashMap::new()),
            events: tx,
            tracker: TaskTracker::new(),
        });
        (dispatcher, rx)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningJob>> {
        // A panic while holding this lock leaves only bookkeeping behind
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running().contains_key(job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    /// Start a job now. Finished jobs are reset and run again.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning`, `Paused`, policy violations and spawn failures.
    /// A spawn failure also marks the record failed.
    pub fn start(self: &Arc<Self>, job_id: &str) -> Result<Job, JobError> {
        self.launch(job_id, Launch::Fresh)
    }

    /// Fire a job the scheduler reported due. A job that is still running
    /// is skipped.
    pub fn trigger_due(self: &Arc<Self>, job_id: &str) {
        if self.is_running(job_id) {
            debug!(job_id, "Due job still running, skipping occurrence");
            return;
        }
        match self.launch(job_id, Launch::Fresh) {
            Ok(job) => info!(job_id, name = %job.name, "Dispatched due job"),
            Err(e) => warn!(job_id, error = %e, "Failed to dispatch due job"),
        }
    }

    fn launch(self: &Arc<Self>, job_id: &str, launch: Launch) -> Result<Job, JobError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Paused => return Err(JobError::Paused(job_id.to_string())),
            JobStatus::Running => return Err(JobError::AlreadyRunning(job_id.to_string())),
            _ => {}
        }
        self.policy.check(&job)?;

        let done = CancellationToken::new();
        {
            let mut running = self.running();
            if running.contains_key(job_id) {
                return Err(JobError::AlreadyRunning(job_id.to_string()));
            }
            running.insert(
                job_id.to_string(),
                RunningJob {
                    pid: None,
                    stop: None,
                    done: done.clone(),
                },
            );
        }

        let result = self.spawn(job_id, launch, done);
        if result.is_err() {
            self.running().remove(job_id);
        }
        result
    }

    fn spawn(
        self: &Arc<Self>,
        job_id: &str,
        launch: Launch,
        done: CancellationToken,
    ) -> Result<Job, JobError> {
        let now = Utc::now();
        let job = self.store.modify(job_id, &mut |job| {
            if job.status.is_terminal() {
                job.reset_for_rerun()?;
            }
            job.transition(JobStatus::Running)?;
            if launch == Launch::Fresh {
                job.retry_count = 0;
            }
            job.started_at = Some(now);
            job.last_error = None;
            Ok(())
        })?;

        let mut child = match build_command(&job).spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                error!(job_id, error = %reason, "Failed to spawn job");
                let failed = self.store.modify(job_id, &mut |job| {
                    job.transition(JobStatus::Failed)?;
                    job.completed_at = Some(Utc::now());
                    job.last_error = Some(format!("spawn failed: {}", reason));
                    Ok(())
                });
                if let Err(e) = failed {
                    warn!(job_id, error = %e, "Failed to record spawn failure");
                }
                return Err(JobError::Spawn {
                    id: job_id.to_string(),
                    reason,
                });
            }
        };

        let pid = child.id();
        let job = match self.store.modify(job_id, &mut |job| {
            job.pid = pid;
            Ok(())
        }) {
            Ok(job) => job,
            Err(e) => {
                // Record vanished between the two updates
                let _ = child.start_kill();
                return Err(e.into());
            }
        };
        if let Some(entry) = self.running().get_mut(job_id) {
            entry.pid = pid;
        }
        info!(job_id, name = %job.name, pid = ?pid, "Job started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let this = Arc::clone(self);
        let supervised = job.clone();
        self.tracker.spawn(async move {
            this.supervise(supervised, child, stdout, stderr, done).await;
        });
        Ok(job)
    }

    async fn supervise(
        self: Arc<Self>,
        job: Job,
        mut child: Child,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        done: CancellationToken,
    ) {
        let limit = self.config.max_output_bytes;
        let stdout = stdout.map(|s| tokio::spawn(read_bounded(s, limit)));
        let stderr = stderr.map(|s| tokio::spawn(read_bounded(s, limit)));

        let timeout = job
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout);
        let (exit, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(exit) => (exit, false),
            Err(_) => {
                warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "Job timed out, killing");
                if let Some(pid) = child.id() {
                    send_signal(pid, libc::SIGKILL);
                }
                let _ = child.start_kill();
                (child.wait().await, true)
            }
        };

        let stdout = join_output(stdout).await;
        let stderr = join_output(stderr).await;
        let stop = self.running().get(&job.id).and_then(|entry| entry.stop);
        let outcome = Outcome::classify(exit, timed_out.then_some(timeout), stop);

        let completed_at = Utc::now();
        let recorded = self.store.modify(&job.id, &mut |record| {
            record.transition(outcome.status)?;
            record.pid = None;
            record.completed_at = Some(completed_at);
            record.exit_code = outcome.exit_code;
            record.stdout = stdout.clone();
            record.stderr = stderr.clone();
            record.last_error = outcome.error.clone();
            Ok(())
        });
        let record = match recorded {
            Ok(record) => Some(record),
            Err(StoreError::NotFound(_)) => {
                debug!(job_id = %job.id, "Job removed while running");
                None
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                None
            }
        };
        self.running().remove(&job.id);
        done.cancel();

        info!(
            job_id = %job.id,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            "Job finished"
        );

        if let Some(record) = &record {
            if self.should_retry(record) {
                if self.retry(record).is_ok() {
                    return;
                }
            }
        }

        let event = JobEvent {
            job_id: job.id.clone(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            error: outcome.error,
            stdout,
            execution_id: job.execution_id().map(str::to_string),
        };
        if self.events.send(event).is_err() {
            debug!(job_id = %job.id, "Job event receiver closed");
        }
    }

    fn should_retry(&self, job: &Job) -> bool {
        job.status == JobStatus::Failed
            && job.execution_id().is_none()
            && job.retry_count < job.max_retries
    }

    /// Re-dispatch a failed standalone job, counting the attempt.
    fn retry(self: &Arc<Self>, job: &Job) -> Result<(), JobError> {
        let attempt = job.retry_count + 1;
        self.store.modify(&job.id, &mut |record| {
            record.reset_for_rerun()?;
            record.retry_count = attempt;
            Ok(())
        })?;
        info!(job_id = %job.id, attempt, max_retries = job.max_retries, "Retrying failed job");
        self.launch(&job.id, Launch::Retry)
            .map(|_| ())
            .map_err(|e| {
                error!(job_id = %job.id, error = %e, "Retry failed to start");
                e
            })
    }

    /// Signal a running job. `signal` defaults to SIGTERM.
    pub fn stop(&self, job_id: &str, signal: Option<&str>) -> Result<Job, JobError> {
        let signal = parse_signal(signal)?;
        self.interrupt(job_id, signal, StopReason::Stop)?;
        self.store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    fn interrupt(&self, job_id: &str, signal: i32, reason: StopReason) -> Result<(), JobError> {
        let pid = {
            let mut running = self.running();
            let entry = running
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotRunning(job_id.to_string()))?;
            if ends_run(signal) {
                entry.stop = Some(reason);
            }
            entry.pid
        };
        let pid = pid.ok_or_else(|| JobError::NotRunning(job_id.to_string()))?;
        info!(job_id, pid, signal, "Signalling job");
        send_signal(pid, signal);
        Ok(())
    }

    /// SIGKILL a running job and wait for its task to finish. Used before
    /// a forced removal.
    pub async fn kill(&self, job_id: &str) {
        let done = self.running().get(job_id).map(|entry| entry.done.clone());
        let Some(done) = done else {
            return;
        };
        if let Err(e) = self.interrupt(job_id, libc::SIGKILL, StopReason::Stop) {
            debug!(job_id, error = %e, "Job exited before kill");
        }
        if tokio::time::timeout(Duration::from_secs(5), done.cancelled())
            .await
            .is_err()
        {
            warn!(job_id, "Killed job did not finish within 5s");
        }
    }

    /// SIGTERM every running job and wait up to `grace`, then SIGKILL what
    /// is left.
    pub async fn stop_all(&self, grace: Duration) {
        let ids: Vec<String> = self.running().keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Stopping running jobs");
        }
        for id in &ids {
            let _ = self.interrupt(id, libc::SIGTERM, StopReason::Stop);
        }

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            let left: Vec<String> = self.running().keys().cloned().collect();
            warn!(count = left.len(), "Jobs ignored SIGTERM, killing");
            for id in &left {
                let _ = self.interrupt(id, libc::SIGKILL, StopReason::Stop);
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), self.tracker.wait()).await;
        }
    }
}

/// Launches the jobs behind workflow `job` nodes.
pub struct WorkflowLauncher {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn JobStore>,
}

impl WorkflowLauncher {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn JobStore>) -> Self {
        Self { dispatcher, store }
    }
}

#[async_trait]
impl JobLauncher for WorkflowLauncher {
    async fn submit(&self, job: Job) -> Result<String, WorkflowError> {
        let job = self.store.create(job)?;
        self.dispatcher
            .start(&job.id)
            .map_err(|e| WorkflowError::Launcher(e.to_string()))?;
        Ok(job.id)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), WorkflowError> {
        match self
            .dispatcher
            .interrupt(job_id, libc::SIGTERM, StopReason::Cancel)
        {
            Ok(()) | Err(JobError::NotRunning(_)) => Ok(()),
            Err(e) => Err(WorkflowError::Launcher(e.to_string())),
        }
    }
}

struct Outcome {
    status: JobStatus,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl Outcome {
    fn classify(
        exit: io::Result<ExitStatus>,
        timed_out: Option<Duration>,
        stop: Option<StopReason>,
    ) -> Self {
        let exit_code = exit.as_ref().ok().and_then(ExitStatus::code);
        let failed = |error: String| Outcome {
            status: JobStatus::Failed,
            exit_code,
            error: Some(error),
        };

        match stop {
            Some(StopReason::Stop) => {
                return Outcome {
                    status: JobStatus::Stopped,
                    exit_code,
                    error: Some("stopped by request".to_string()),
                }
            }
            Some(StopReason::Cancel) => {
                return Outcome {
                    status: JobStatus::Cancelled,
                    exit_code,
                    error: Some("cancelled".to_string()),
                }
            }
            None => {}
        }
        if let Some(timeout) = timed_out {
            return failed(format!("timed out after {}s", timeout.as_secs()));
        }
        match exit {
            Ok(status) if status.success() => Outcome {
                status: JobStatus::Completed,
                exit_code,
                error: None,
            },
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => failed(format!("exited with code {}", code)),
                (None, Some(signal)) => failed(format!("killed by signal {}", signal)),
                (None, None) => failed("exited abnormally".to_string()),
            },
            Err(e) => failed(format!("wait failed: {}", e)),
        }
    }
}

fn build_command(job: &Job) -> Command {
    let mut command = match job.job_type {
        JobType::Shell => {
            let mut command = std::process::Command::new("sh");
            command.arg("-c").arg(&job.command);
            if !job.args.is_empty() {
                // $0, then $1.. for the args
                command.arg(&job.name).args(&job.args);
            }
            command
        }
        JobType::Exec => {
            let mut command = std::process::Command::new(&job.command);
            command.args(&job.args);
            command
        }
    };
    if let Some(cwd) = &job.cwd {
        command.current_dir(cwd);
    }
    // Own process group so signals reach the whole pipeline
    command
        .envs(&job.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut command = Command::from(command);
    command.kill_on_drop(true);
    command
}

/// Read the whole stream, keeping at most `limit` bytes.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    text
}

async fn join_output(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Map a signal name (`TERM`, `SIGKILL`, `9`) to its number.
fn parse_signal(signal: Option<&str>) -> Result<i32, JobError> {
    let Some(raw) = signal else {
        return Ok(libc::SIGTERM);
    };
    if let Ok(number) = raw.parse::<i32>() {
        return Ok(number);
    }
    let name = raw.trim().to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    match name {
        "TERM" => Ok(libc::SIGTERM),
        "KILL" => Ok(libc::SIGKILL),
        "INT" => Ok(libc::SIGINT),
        "HUP" => Ok(libc::SIGHUP),
        "QUIT" => Ok(libc::SIGQUIT),
        "USR1" => Ok(libc::SIGUSR1),
        "USR2" => Ok(libc::SIGUSR2),
        _ => Err(JobError::Signal(raw.to_string())),
    }
}

/// Whether sending `signal` is a request to end the run. Other signals
/// (`USR1`, `0`) are passed through and the run is classified by how the
/// process actually exits.
fn ends_run(signal: i32) -> bool {
    matches!(
        signal,
        libc::SIGTERM | libc::SIGKILL | libc::SIGINT | libc::SIGHUP | libc::SIGQUIT
    )
}

/// Signal the job's process group, falling back to the process itself.
fn send_signal(pid: u32, signal: i32) {
    let pid = pid as i32;
    unsafe {
        if libc::kill(-pid, signal) != 0 && libc::kill(pid, signal) != 0 {
            debug!(pid, signal, "Signal not delivered, process already gone");
        }
    }
}
