//! Client for the daemon's control socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use jobd_types::{Job, JobFilter, JobSpec, WorkflowDefinition, WorkflowExecution};

use crate::error::ClientError;
use crate::protocol::{commands, write_message, DaemonStatus, IpcRequest, IpcResponse, MessageReader};

/// Default time to wait for a response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One connection to the daemon. Requests are sent sequentially.
pub struct DaemonClient {
    path: PathBuf,
    reader: MessageReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    timeout: Duration,
}

impl DaemonClient {
    /// Connect to the daemon listening on `socket_path`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` if the socket cannot be reached;
    /// [`ClientError::is_not_running`] tells a stopped daemon apart.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = socket_path.as_ref().to_path_buf();
        debug!(path = %path.display(), "Connecting to daemon");
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|source| ClientError::Connection {
                path: path.clone(),
                source,
            })?;
        let (read, write) = stream.into_split();
        Ok(Self {
            path,
            reader: MessageReader::new(read),
            writer: write,
            next_id: 1,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Send `command` and return the response `data`.
    ///
    /// # Errors
    ///
    /// `ClientError::Daemon` carries the daemon's error message when it
    /// answers with `success: false`.
    pub async fn request(&mut self, command: &str, args: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut request = IpcRequest::new(command).with_id(id);
        if let Some(args) = args {
            request = request.with_args(args);
        }

        let response = tokio::time::timeout(self.timeout, async {
            write_message(&mut self.writer, &request).await?;
            self.reader.next::<IpcResponse>().await
        })
        .await
        .map_err(|_| ClientError::Timeout(self.timeout))??;

        let response = response.ok_or_else(|| {
            ClientError::Protocol("daemon closed the connection".to_string())
        })?;
        if response.id != Some(json!(id)) {
            return Err(ClientError::Protocol(format!(
                "response id {:?} does not match request {}",
                response.id, id
            )));
        }
        if !response.success {
            return Err(ClientError::Daemon(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        debug!(command, id, "Request succeeded");
        Ok(response.data.unwrap_or(Value::Null))
    }

    async fn request_as<T: DeserializeOwned>(
        &mut self,
        command: &str,
        args: Option<Value>,
    ) -> Result<T, ClientError> {
        let data = self.request(command, args).await?;
        Ok(serde_json::from_value(data)?)
    }

    // Daemon

    pub async fn status(&mut self) -> Result<DaemonStatus, ClientError> {
        self.request_as(commands::STATUS, None).await
    }

    /// Ask the daemon to restart in place.
    pub async fn restart(&mut self) -> Result<(), ClientError> {
        self.request(commands::RESTART, None).await.map(|_| ())
    }

    /// Ask the daemon to shut down.
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        self.request(commands::STOP, None).await.map(|_| ())
    }

    // Jobs

    pub async fn add_job(&mut self, spec: &JobSpec) -> Result<Job, ClientError> {
        self.request_as(commands::ADD_JOB, Some(serde_json::to_value(spec)?))
            .await
    }

    pub async fn start_job(&mut self, id: &str) -> Result<Job, ClientError> {
        self.request_as(commands::START_JOB, Some(json!({ "id": id })))
            .await
    }

    /// Run a job now, outside its schedule.
    pub async fn trigger_job(&mut self, id: &str) -> Result<Job, ClientError> {
        self.request_as(commands::TRIGGER_JOB, Some(json!({ "id": id })))
            .await
    }

    pub async fn stop_job(&mut self, id: &str, signal: Option<&str>) -> Result<Job, ClientError> {
        self.request_as(
            commands::STOP_JOB,
            Some(json!({ "id": id, "signal": signal })),
        )
        .await
    }

    pub async fn pause_job(&mut self, id: &str) -> Result<Job, ClientError> {
        self.request_as(commands::PAUSE_JOB, Some(json!({ "id": id })))
            .await
    }

    pub async fn resume_job(&mut self, id: &str) -> Result<Job, ClientError> {
        self.request_as(commands::RESUME_JOB, Some(json!({ "id": id })))
            .await
    }

    pub async fn list_jobs(&mut self, filter: &JobFilter) -> Result<Vec<Job>, ClientError> {
        self.request_as(commands::LIST_JOBS, Some(serde_json::to_value(filter)?))
            .await
    }

    pub async fn get_job(&mut self, id: &str) -> Result<Job, ClientError> {
        self.request_as(commands::GET_JOB, Some(json!({ "id": id })))
            .await
    }

    /// Remove a job. A running job is refused unless `force` is set.
    pub async fn remove_job(&mut self, id: &str, force: bool) -> Result<(), ClientError> {
        self.request(commands::REMOVE_JOB, Some(json!({ "id": id, "force": force })))
            .await
            .map(|_| ())
    }

    // Workflows

    pub async fn create_workflow(
        &mut self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ClientError> {
        self.request_as(
            commands::CREATE_WORKFLOW,
            Some(serde_json::to_value(definition)?),
        )
        .await
    }

    pub async fn update_workflow(
        &mut self,
        id: &str,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ClientError> {
        self.request_as(
            commands::UPDATE_WORKFLOW,
            Some(json!({ "id": id, "definition": definition })),
        )
        .await
    }

    pub async fn get_workflow(&mut self, id: &str) -> Result<WorkflowDefinition, ClientError> {
        self.request_as(commands::GET_WORKFLOW, Some(json!({ "id": id })))
            .await
    }

    pub async fn list_workflows(&mut self) -> Result<Vec<WorkflowDefinition>, ClientError> {
        self.request_as(commands::LIST_WORKFLOWS, None).await
    }

    pub async fn delete_workflow(&mut self, id: &str) -> Result<(), ClientError> {
        self.request(commands::DELETE_WORKFLOW, Some(json!({ "id": id })))
            .await
            .map(|_| ())
    }

    pub async fn execute_workflow(
        &mut self,
        id: &str,
        params: Map<String, Value>,
    ) -> Result<WorkflowExecution, ClientError> {
        self.request_as(
            commands::EXECUTE_WORKFLOW,
            Some(json!({ "id": id, "params": params })),
        )
        .await
    }

    pub async fn get_execution(&mut self, id: &str) -> Result<WorkflowExecution, ClientError> {
        self.request_as(commands::GET_EXECUTION, Some(json!({ "id": id })))
            .await
    }

    pub async fn list_executions(
        &mut self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, ClientError> {
        self.request_as(
            commands::LIST_EXECUTIONS,
            Some(json!({ "workflow_id": workflow_id })),
        )
        .await
    }

    pub async fn cancel_execution(&mut self, id: &str) -> Result<WorkflowExecution, ClientError> {
        self.request_as(commands::CANCEL_EXECUTION, Some(json!({ "id": id })))
            .await
    }
}
