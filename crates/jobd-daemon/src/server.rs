//! Control-socket server.
//!
//! One task per connection. Requests are read with [`MessageReader`], so
//! clients may pipeline several messages in one write or split one message
//! across many. Every request gets exactly one response; handler errors
//! become `success: false` responses and never close the connection.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobd_client::{
    commands, write_message, ClientError, ExecuteWorkflowArgs, IdArgs, IpcRequest, IpcResponse,
    ListExecutionsArgs, MessageReader, RemoveJobArgs, StopJobArgs, UpdateWorkflowArgs,
};
use jobd_types::{JobFilter, JobSpec, WorkflowDefinition};

use crate::daemon::{ControlRequest, Daemon};

/// Accept connections until `shutdown` is cancelled.
pub async fn serve(
    listener: UnixListener,
    daemon: Arc<Daemon>,
    shutdown: CancellationToken,
) -> &'static str {
    info!("IPC server listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let daemon = daemon.clone();
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, daemon, token).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
    info!("IPC server stopped");
    "ipc server"
}

async fn handle_connection(stream: UnixStream, daemon: Arc<Daemon>, shutdown: CancellationToken) {
    let (read, mut write) = stream.into_split();
    let mut reader = MessageReader::new(read);
    debug!("Client connected");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = reader.next_value() => message,
        };
        let response = match message {
            Ok(Some(value)) => match serde_json::from_value::<IpcRequest>(value) {
                Ok(request) => dispatch(&daemon, request).await,
                Err(e) => IpcResponse::err(None, format!("Invalid request: {}", e)),
            },
            Ok(None) => break,
            Err(ClientError::Serialization(e)) => {
                IpcResponse::err(None, format!("Malformed JSON: {}", e))
            }
            Err(e) => {
                debug!(error = %e, "Closing connection");
                break;
            }
        };
        if let Err(e) = write_message(&mut write, &response).await {
            debug!(error = %e, "Failed to write response");
            break;
        }
    }
    debug!("Client disconnected");
}

/// Route one request to its handler.
pub async fn dispatch(daemon: &Daemon, request: IpcRequest) -> IpcResponse {
    let id = request.id.clone();
    debug!(command = %request.command, "Handling request");
    match handle(daemon, &request).await {
        Ok(data) => IpcResponse::ok(id, data),
        Err(message) => {
            debug!(command = %request.command, error = %message, "Request failed");
            IpcResponse::err(id, message)
        }
    }
}

fn args<T: DeserializeOwned>(request: &IpcRequest) -> Result<T, String> {
    request
        .args_as()
        .map_err(|e| format!("Invalid arguments for {}: {}", request.command, e))
}

fn to_data<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn fail(e: impl std::fmt::Display) -> String {
    e.to_string()
}

async fn handle(daemon: &Daemon, request: &IpcRequest) -> Result<Value, String> {
    match request.command.as_str() {
        commands::STATUS => to_data(daemon.status().await.map_err(fail)?),
        commands::RESTART => {
            daemon.request(ControlRequest::Restart);
            to_data(serde_json::json!({ "restarting": true }))
        }
        commands::STOP => {
            daemon.request(ControlRequest::Stop);
            to_data(serde_json::json!({ "stopping": true }))
        }

        commands::ADD_JOB => {
            let spec: JobSpec = args(request)?;
            to_data(daemon.add_job(spec).map_err(fail)?)
        }
        commands::START_JOB | commands::TRIGGER_JOB => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.start_job(&id).map_err(fail)?)
        }
        commands::STOP_JOB => {
            let StopJobArgs { id, signal } = args(request)?;
            to_data(daemon.stop_job(&id, signal.as_deref()).map_err(fail)?)
        }
        commands::PAUSE_JOB => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.pause_job(&id).map_err(fail)?)
        }
        commands::RESUME_JOB => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.resume_job(&id).map_err(fail)?)
        }
        commands::LIST_JOBS => {
            let filter: JobFilter = args(request)?;
            to_data(daemon.list_jobs(&filter).map_err(fail)?)
        }
        commands::GET_JOB => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.get_job(&id).map_err(fail)?)
        }
        commands::REMOVE_JOB => {
            let RemoveJobArgs { id, force } = args(request)?;
            daemon.remove_job(&id, force).await.map_err(fail)?;
            to_data(serde_json::json!({ "removed": id }))
        }

        commands::CREATE_WORKFLOW => {
            let definition: WorkflowDefinition = args(request)?;
            to_data(daemon.engine.create_workflow(definition).await.map_err(fail)?)
        }
        commands::UPDATE_WORKFLOW => {
            let UpdateWorkflowArgs { id, definition } = args(request)?;
            to_data(
                daemon
                    .engine
                    .update_workflow(&id, definition)
                    .await
                    .map_err(fail)?,
            )
        }
        commands::GET_WORKFLOW => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.engine.get_workflow(&id).await.map_err(fail)?)
        }
        commands::LIST_WORKFLOWS => to_data(daemon.engine.list_workflows().await),
        commands::DELETE_WORKFLOW => {
            let IdArgs { id } = args(request)?;
            daemon.engine.delete_workflow(&id).await.map_err(fail)?;
            to_data(serde_json::json!({ "deleted": id }))
        }
        commands::EXECUTE_WORKFLOW => {
            let ExecuteWorkflowArgs { id, params } = args(request)?;
            to_data(
                daemon
                    .engine
                    .execute_workflow(&id, params)
                    .await
                    .map_err(fail)?,
            )
        }
        commands::GET_EXECUTION => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.engine.get_execution(&id).await.map_err(fail)?)
        }
        commands::LIST_EXECUTIONS => {
            let ListExecutionsArgs { workflow_id } = args(request)?;
            to_data(
                daemon
                    .engine
                    .list_executions(workflow_id.as_deref())
                    .await
                    .map_err(fail)?,
            )
        }
        commands::CANCEL_EXECUTION => {
            let IdArgs { id } = args(request)?;
            to_data(daemon.engine.cancel_execution(&id).await.map_err(fail)?)
        }

        other => Err(format!("Unknown command: {}", other)),
    }
}
