//! Control-socket wire protocol.
//!
//! Requests are JSON objects `{id?, command, args?}`; responses are
//! `{success, data|error, id}` echoing the request id. Messages are not
//! framed: a connection carries a stream of concatenated JSON values, with
//! or without whitespace between them, and one value may arrive split over
//! several reads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use jobd_types::WorkflowDefinition;

use crate::ClientError;

/// Upper bound on a single buffered message.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Command names understood by the daemon.
pub mod commands {
    pub const STATUS: &str = "status";
    pub const ADD_JOB: &str = "addJob";
    pub const START_JOB: &str = "startJob";
    pub const TRIGGER_JOB: &str = "triggerJob";
    pub const STOP_JOB: &str = "stopJob";
    pub const PAUSE_JOB: &str = "pauseJob";
    pub const RESUME_JOB: &str = "resumeJob";
    pub const LIST_JOBS: &str = "listJobs";
    pub const GET_JOB: &str = "getJob";
    pub const REMOVE_JOB: &str = "removeJob";
    pub const RESTART: &str = "restart";
    pub const STOP: &str = "stop";

    pub const CREATE_WORKFLOW: &str = "createWorkflow";
    pub const UPDATE_WORKFLOW: &str = "updateWorkflow";
    pub const GET_WORKFLOW: &str = "getWorkflow";
    pub const LIST_WORKFLOWS: &str = "listWorkflows";
    pub const DELETE_WORKFLOW: &str = "deleteWorkflow";
    pub const EXECUTE_WORKFLOW: &str = "executeWorkflow";
    pub const GET_EXECUTION: &str = "getExecution";
    pub const LIST_EXECUTIONS: &str = "listExecutions";
    pub const CANCEL_EXECUTION: &str = "cancelExecution";
}

/// A command sent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl IpcRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            args: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Decode `args` into a typed payload. Missing args decode as `{}`.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.args {
            Some(Value::Null) | None => serde_json::from_value(Value::Object(Map::new())),
            Some(args) => serde_json::from_value(args.clone()),
        }
    }
}

/// The daemon's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl IpcResponse {
    pub fn ok(id: Option<Value>, data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            id,
        }
    }

    pub fn err(id: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            id,
        }
    }
}

/// `{id}` for single-object commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdArgs {
    pub id: String,
}

/// Arguments of `stopJob`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopJobArgs {
    pub id: String,
    /// Signal name (`SIGTERM`, `KILL`, ...) or number; defaults to SIGTERM
    #[serde(default)]
    pub signal: Option<String>,
}

/// Arguments of `removeJob`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveJobArgs {
    pub id: String,
    /// Kill a running job before removing it
    #[serde(default)]
    pub force: bool,
}

/// Arguments of `updateWorkflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateWorkflowArgs {
    pub id: String,
    pub definition: WorkflowDefinition,
}

/// Arguments of `executeWorkflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteWorkflowArgs {
    pub id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Arguments of `listExecutions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListExecutionsArgs {
    #[serde(default)]
    pub workflow_id: Option<String>,
}

/// Scheduler part of the status payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// `priority` or `legacy`
    pub kind: String,
    pub total_scheduled_jobs: usize,
    pub due_checks: u64,
    pub jobs_fired: u64,
    pub last_wake: Option<DateTime<Utc>>,
}

/// Payload of the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub version: String,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    /// Job count per status name, every status present
    pub jobs: BTreeMap<String, usize>,
    pub running_processes: usize,
    /// Resident set size, where the platform exposes it
    pub memory_rss_bytes: Option<u64>,
    pub scheduler: SchedulerStatus,
    pub active_executions: usize,
    pub workflows: usize,
    pub restarts: u32,
}

/// Reads a stream of concatenated JSON values.
///
/// Object, array and string values are delimited by an incremental scan
/// that resumes where the previous read stopped, so a large message split
/// over many reads is only parsed once it is complete.
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Start of the unconsumed input in `buf`
    start: usize,
    scan: FrameScan,
}

/// Delimiter state for the value starting at `MessageReader::start`.
#[derive(Debug, Default)]
struct FrameScan {
    /// Offset in `buf` up to which bytes have been scanned
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScan {
    /// Continue scanning `buf` and return the end offset (exclusive) of the
    /// value once its closing delimiter is seen.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        while self.pos < buf.len() {
            let b = buf[self.pos];
            self.pos += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            start: 0,
            scan: FrameScan::default(),
        }
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn consume_to(&mut self, end: usize) {
        self.start = end;
        self.scan = FrameScan {
            pos: end,
            ..FrameScan::default()
        };
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.consume_to(0);
    }

    /// Try to take one complete value from the buffered input.
    fn take_value(&mut self) -> Result<Option<Value>, serde_json::Error> {
        if self.scan.pos == self.start {
            let leading = self
                .pending()
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(self.buf.len() - self.start);
            self.consume_to(self.start + leading);
        }
        let Some(&first) = self.buf.get(self.start) else {
            return Ok(None);
        };

        if matches!(first, b'{' | b'[' | b'"') {
            let Some(end) = self.scan.advance(&self.buf) else {
                return Ok(None);
            };
            let value = serde_json::from_slice(&self.buf[self.start..end]);
            self.consume_to(end);
            return value.map(Some);
        }

        // Bare scalars are short; let the parser find their end.
        let mut stream = serde_json::Deserializer::from_slice(self.pending()).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let used = stream.byte_offset();
                self.consume_to(self.start + used);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Next complete JSON value, or `None` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// Syntax errors discard the buffered input and are returned as
    /// `ClientError::Serialization`; the reader stays usable.
    pub async fn next_value(&mut self) -> Result<Option<Value>, ClientError> {
        loop {
            match self.take_value() {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => {
                    self.reset();
                    return Err(e.into());
                }
            }

            if self.pending().len() > MAX_MESSAGE_BYTES {
                self.reset();
                return Err(ClientError::Protocol(format!(
                    "message exceeds {} bytes",
                    MAX_MESSAGE_BYTES
                )));
            }

            // Drop consumed input before growing the buffer.
            if self.start > 0 {
                let consumed = self.start;
                self.buf.drain(..consumed);
                self.start = 0;
                self.scan.pos -= consumed;
            }

            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.buf.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    self.reset();
                    Err(ClientError::Protocol(
                        "connection closed in the middle of a message".to_string(),
                    ))
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next value decoded as `T`. A value of the wrong shape is consumed
    /// and reported, it does not poison the stream.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ClientError> {
        match self.next_value().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

/// Serialize `message` and write it followed by a newline.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_concatenated_values_without_separators() {
        let input: &[u8] = br#"{"command":"status"}{"id":2,"command":"listJobs"}  {"command":"stop"}"#;
        let mut reader = MessageReader::new(input);

        let first: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(first.command, "status");
        let second: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(second.id, Some(json!(2)));
        let third: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(third.command, "stop");
        assert!(reader.next::<IpcRequest>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_value_split_across_writes() {
        let (client, server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            let mut client = client;
            let pieces: [&[u8]; 3] = [
                b"{\"comm",
                b"and\":\"get",
                b"Job\",\"args\":{\"id\":\"j1\"}}\n",
            ];
            for piece in pieces {
                client.write_all(piece).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = MessageReader::new(server);
        let request: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(request.command, "getJob");
        let args: IdArgs = request.args_as().unwrap();
        assert_eq!(args.id, "j1");
        writer.await.unwrap();
        assert!(reader.next_value().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_many_pipelined_messages() {
        let mut input = Vec::new();
        for i in 0..2000 {
            input.extend_from_slice(format!(r#"{{"id":{i},"command":"status"}}"#).as_bytes());
        }
        let mut reader = MessageReader::new(input.as_slice());

        for i in 0..2000 {
            let request: IpcRequest = reader.next().await.unwrap().unwrap();
            assert_eq!(request.id, Some(json!(i)));
        }
        assert!(reader.next_value().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_message_in_small_pieces() {
        let payload = "x{\"}]\\\\".repeat(20_000);
        let message = serde_json::to_vec(&json!({"command": "addJob", "args": {"command": payload}})).unwrap();

        let (client, server) = tokio::io::duplex(512);
        let writer = tokio::spawn(async move {
            let mut client = client;
            for piece in message.chunks(97) {
                client.write_all(piece).await.unwrap();
            }
            client.write_all(br#" {"command":"status"}"#).await.unwrap();
        });

        let mut reader = MessageReader::new(server);
        let request: IpcRequest = reader.next().await.unwrap().unwrap();
        let args = request.args.unwrap();
        assert_eq!(args["command"].as_str(), Some(payload.as_str()));
        let request: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(request.command, "status");
        writer.await.unwrap();
        assert!(reader.next_value().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_syntax_error_then_recovers() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = MessageReader::new(server);

        client.write_all(b"{not json}").await.unwrap();
        assert!(matches!(
            reader.next_value().await,
            Err(ClientError::Serialization(_))
        ));

        client.write_all(br#"{"command":"status"}"#).await.unwrap();
        let request: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(request.command, "status");
    }

    #[tokio::test]
    async fn test_wrong_shape_is_consumed() {
        let input: &[u8] = br#"[1,2,3]{"command":"status"}"#;
        let mut reader = MessageReader::new(input);
        assert!(reader.next::<IpcRequest>().await.is_err());
        let request: IpcRequest = reader.next().await.unwrap().unwrap();
        assert_eq!(request.command, "status");
    }

    #[tokio::test]
    async fn test_truncated_stream_is_protocol_error() {
        let input: &[u8] = br#"{"command":"sta"#;
        let mut reader = MessageReader::new(input);
        assert!(matches!(
            reader.next_value().await,
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(IpcResponse::ok(Some(json!(7)), json!({"n": 1}))).unwrap();
        assert_eq!(ok, json!({"success": true, "data": {"n": 1}, "id": 7}));

        let err = serde_json::to_value(IpcResponse::err(None, "unknown command: nope")).unwrap();
        assert_eq!(
            err,
            json!({"success": false, "error": "unknown command: nope", "id": null})
        );
    }

    #[test]
    fn test_missing_args_decode_as_empty_object() {
        let request = IpcRequest::new(commands::LIST_EXECUTIONS);
        let args: ListExecutionsArgs = request.args_as().unwrap();
        assert!(args.workflow_id.is_none());

        let request = IpcRequest::new(commands::REMOVE_JOB).with_args(json!({"id": "x"}));
        let args: RemoveJobArgs = request.args_as().unwrap();
        assert!(!args.force);
    }
}
