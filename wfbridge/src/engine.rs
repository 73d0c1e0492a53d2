//! Contract with the orchestration engine.
//!
//! The engine owns durability, history, retries and scheduling. This module
//! only describes what the bridge needs from it: worker handles to register
//! entry points on, activity invocation metadata, and the workflow
//! environment that scheduled work is handed to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
pub use tokio_util::sync::CancellationToken;

use crate::BridgeError;
use crate::bridge::protocol::{bytes_b64, duration_nanos};
use crate::converter::Payloads;

/// Opaque engine-assigned identifier of one in-flight activity attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskToken(#[serde(with = "bytes_b64")] Vec<u8>);

impl TaskToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for TaskToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use base64::Engine;
        f.write_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeName {
    #[serde(rename = "Name")]
    pub name: String,
}

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
}

/// Activity invocation metadata, forwarded verbatim to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivityInfo {
    pub task_token: TaskToken,
    pub workflow_type: TypeName,
    pub workflow_namespace: String,
    pub workflow_execution: WorkflowExecution,
    #[serde(rename = "ActivityID")]
    pub activity_id: String,
    pub activity_type: TypeName,
    pub task_queue: String,
    #[serde(with = "duration_nanos")]
    pub heartbeat_timeout: Duration,
    pub scheduled_time: DateTime<Utc>,
    pub started_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub attempt: i32,
}

/// Execution context of one activity attempt.
///
/// Cheap to clone; clones share the cancellation token.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    info: Arc<ActivityInfo>,
    heartbeat_details: Option<Payloads>,
    cancel: CancellationToken,
}

impl ActivityContext {
    pub fn new(info: ActivityInfo) -> Self {
        Self {
            info: Arc::new(info),
            heartbeat_details: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the progress recorded by the last heartbeat of a previous attempt.
    pub fn with_heartbeat_details(mut self, details: Payloads) -> Self {
        self.heartbeat_details = Some(details);
        self
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    pub fn task_token(&self) -> &TaskToken {
        &self.info.task_token
    }

    pub fn has_heartbeat_details(&self) -> bool {
        self.heartbeat_details.as_ref().is_some_and(|d| !d.is_empty())
    }

    pub fn heartbeat_details(&self) -> Option<&Payloads> {
        self.heartbeat_details.as_ref()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// How an activity attempt ended from the bridge's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityOutcome {
    Completed(Payloads),
    /// The worker will complete the activity out of band (by task token).
    Pending,
}

/// The engine's failure representation.
#[derive(Debug, Clone, Default, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApplicationError {
    pub message: String,
    pub kind: String,
    pub non_retryable: bool,
    pub details: Vec<Value>,
    pub cause: Option<Box<ApplicationError>>,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RetryPolicy {
    #[serde(with = "duration_nanos")]
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    #[serde(with = "duration_nanos")]
    pub maximum_interval: Duration,
    pub maximum_attempts: i32,
    pub non_retryable_error_types: Vec<String>,
}

/// Options a workflow worker attaches to `ExecuteActivity`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActivityOptions {
    pub task_queue: String,
    #[serde(with = "duration_nanos")]
    pub schedule_to_close_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub schedule_to_start_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub start_to_close_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub heartbeat_timeout: Duration,
    pub wait_for_cancellation: bool,
    #[serde(rename = "ActivityID")]
    pub activity_id: String,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChildWorkflowOptions {
    pub namespace: String,
    #[serde(rename = "WorkflowID")]
    pub workflow_id: String,
    pub task_queue: String,
    #[serde(with = "duration_nanos")]
    pub workflow_execution_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub workflow_run_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub workflow_task_timeout: Duration,
    pub wait_for_cancellation: bool,
    pub retry_policy: Option<RetryPolicy>,
}

/// Runtime options advertised by a worker for its task queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkerOptions {
    pub max_concurrent_activity_execution_size: usize,
    pub max_concurrent_workflow_task_execution_size: usize,
    pub max_concurrent_activity_task_pollers: usize,
    pub max_concurrent_workflow_task_pollers: usize,
    pub enable_session_worker: bool,
    #[serde(with = "duration_nanos")]
    pub sticky_schedule_to_start_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub worker_stop_timeout: Duration,
    pub identity: String,
}

/// Identity of the workflow run a definition executes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowExecutionInfo {
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    pub task_queue: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityParams {
    pub name: String,
    pub input: Payloads,
    pub options: ActivityOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildWorkflowParams {
    pub name: String,
    pub input: Payloads,
    pub options: ChildWorkflowOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSignalParams {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub signal: String,
    pub input: Payloads,
    pub child_workflow_only: bool,
}

/// Engine-side handle to scheduled work, used to request cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledHandle {
    Activity(u64),
    Timer(u64),
    ChildWorkflow(u64),
}

/// Invoked by the engine once scheduled work resolves.
pub type ResultCallback = Box<dyn FnOnce(Result<Payloads, ApplicationError>) + Send>;

/// Deterministic primitives the engine exposes to one workflow run.
pub trait WorkflowEnvironment: Send + Sync {
    fn workflow_info(&self) -> WorkflowExecutionInfo;

    fn is_replaying(&self) -> bool;

    fn now(&self) -> DateTime<Utc>;

    fn history_length(&self) -> i64 {
        0
    }

    fn execute_activity(&self, params: ActivityParams, callback: ResultCallback) -> ScheduledHandle;

    fn new_timer(&self, duration: Duration, callback: ResultCallback) -> ScheduledHandle;

    fn execute_child_workflow(
        &self,
        params: ChildWorkflowParams,
        callback: ResultCallback,
    ) -> ScheduledHandle;

    fn signal_external_workflow(&self, params: ExternalSignalParams, callback: ResultCallback);

    fn request_cancel(&self, handle: ScheduledHandle);

    fn complete(&self, result: Result<Payloads, ApplicationError>);
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to create worker for task queue {task_queue}: {reason}")]
    CreateWorker { task_queue: String, reason: String },
    #[error("registration of {name} failed: {reason}")]
    Registration { name: String, reason: String },
    #[error("worker start failed: {0}")]
    Start(String),
}

/// Entry point the engine calls for every activity attempt.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: ActivityContext,
        args: Payloads,
    ) -> Result<ActivityOutcome, BridgeError>;
}

/// Replay-driven workflow implementation, one instance per workflow run.
#[async_trait]
pub trait WorkflowDefinition: Send {
    async fn execute(
        &mut self,
        env: Arc<dyn WorkflowEnvironment>,
        input: Payloads,
    ) -> Result<(), BridgeError>;

    async fn on_workflow_task_started(&mut self) -> Result<(), BridgeError>;

    async fn handle_signal(&mut self, name: &str, input: Payloads) -> Result<(), BridgeError>;

    async fn handle_query(&mut self, name: &str, args: Payloads) -> Result<Payloads, BridgeError>;

    fn stack_trace(&self) -> String;

    async fn close(&mut self);
}

pub trait WorkflowDefinitionFactory: Send + Sync {
    fn new_definition(&self) -> Box<dyn WorkflowDefinition>;
}

/// One engine-side worker polling a single task queue.
#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn task_queue(&self) -> &str;

    fn register_activity(
        &mut self,
        name: &str,
        handler: Arc<dyn ActivityHandler>,
    ) -> Result<(), EngineError>;

    fn register_workflow(
        &mut self,
        name: &str,
        factory: Arc<dyn WorkflowDefinitionFactory>,
    ) -> Result<(), EngineError>;

    async fn start(&mut self) -> Result<(), EngineError>;

    async fn stop(&mut self);
}

/// The orchestration engine itself.
pub trait Engine: Send + Sync {
    fn new_worker(
        &self,
        task_queue: &str,
        options: WorkerOptions,
    ) -> Result<Box<dyn EngineWorker>, EngineError>;

    /// Drop every cached workflow run so the next task replays from history.
    fn purge_sticky_cache(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_info_uses_worker_field_names() {
        let info = ActivityInfo {
            task_token: TaskToken::new(b"tok".to_vec()),
            activity_type: TypeName::new("Echo"),
            workflow_execution: WorkflowExecution {
                id: "wf-1".to_string(),
                run_id: "run-1".to_string(),
            },
            activity_id: "5".to_string(),
            task_queue: "default".to_string(),
            heartbeat_timeout: Duration::from_secs(2),
            attempt: 3,
            ..ActivityInfo::default()
        };

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["TaskToken"], "dG9r");
        assert_eq!(value["ActivityType"]["Name"], "Echo");
        assert_eq!(value["WorkflowExecution"]["RunID"], "run-1");
        assert_eq!(value["ActivityID"], "5");
        assert_eq!(value["HeartbeatTimeout"], 2_000_000_000u64);
        assert_eq!(value["Attempt"], 3);

        let back: ActivityInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn activity_options_default_missing_fields() {
        let options: ActivityOptions = serde_json::from_value(serde_json::json!({
            "TaskQueue": "default",
            "StartToCloseTimeout": 5_000_000_000u64
        }))
        .unwrap();

        assert_eq!(options.task_queue, "default");
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(5));
        assert_eq!(options.heartbeat_timeout, Duration::ZERO);
        assert!(options.retry_policy.is_none());
    }

    #[test]
    fn context_clones_share_cancellation() {
        let ctx = ActivityContext::new(ActivityInfo::default());
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(clone.is_cancelled());
        assert!(!ctx.has_heartbeat_details());
    }
}
