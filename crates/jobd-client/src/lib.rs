//! Client library for the jobd daemon.
//!
//! This crate provides:
//! - The IPC wire types (`IpcRequest`, `IpcResponse`) and argument payloads
//! - `MessageReader`, a framing-free JSON stream reader shared with the daemon
//! - `DaemonClient` for issuing commands over the control socket
//!
//! # Example
//!
//! ```rust,no_run
//! use jobd_client::DaemonClient;
//! use jobd_types::JobSpec;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = DaemonClient::connect("/run/user/1000/jobd/jobd.sock").await?;
//!     let job = client.add_job(&JobSpec::new("hello", "echo hello")).await?;
//!     client.start_job(&job.id).await?;
//!     println!("{:?}", client.status().await?);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{DaemonClient, DEFAULT_TIMEOUT};
pub use error::ClientError;
pub use protocol::{
    commands, write_message, DaemonStatus, ExecuteWorkflowArgs, IdArgs, IpcRequest, IpcResponse,
    ListExecutionsArgs, MessageReader, RemoveJobArgs, SchedulerStatus, StopJobArgs,
    UpdateWorkflowArgs,
};
