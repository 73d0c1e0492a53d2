//! Closed command set spoken between the bridge and workers.
//!
//! [`parse_command`] is the only place a command name is matched as a
//! string. Past that point everything is a total `match` over [`Command`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::protocol::RawOptions;
use crate::converter::{DataConverter, Payloads};
use crate::engine::{ActivityInfo, ActivityOptions, ChildWorkflowOptions, WorkflowExecutionInfo};
use crate::error::ProtocolError;

pub const GET_WORKER_INFO: &str = "GetWorkerInfo";
pub const INVOKE_ACTIVITY: &str = "InvokeActivity";
pub const START_WORKFLOW: &str = "StartWorkflow";
pub const INVOKE_SIGNAL: &str = "InvokeSignal";
pub const INVOKE_QUERY: &str = "InvokeQuery";
pub const DESTROY_WORKFLOW: &str = "DestroyWorkflow";
pub const EXECUTE_ACTIVITY: &str = "ExecuteActivity";
pub const NEW_TIMER: &str = "NewTimer";
pub const COMPLETE_WORKFLOW: &str = "CompleteWorkflow";
pub const CANCEL: &str = "Cancel";
pub const EXECUTE_CHILD_WORKFLOW: &str = "ExecuteChildWorkflow";
pub const SIGNAL_EXTERNAL_WORKFLOW: &str = "SignalExternalWorkflow";

/// Catalogue discovery request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetWorkerInfo {
    #[serde(rename = "rr_version", default)]
    pub version: String,
}

/// Run one activity attempt. Arguments (followed by heartbeat details)
/// travel in the message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeActivity {
    pub name: String,
    pub info: ActivityInfo,
    /// Number of trailing payloads that are heartbeat details.
    #[serde(rename = "heartbeatDetails", default)]
    pub heartbeat_details: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartWorkflow {
    pub name: String,
    #[serde(rename = "wid")]
    pub workflow_id: String,
    #[serde(rename = "rid")]
    pub run_id: String,
    #[serde(rename = "taskQueue")]
    pub task_queue: String,
    #[serde(rename = "args", default)]
    pub input: Vec<Value>,
}

impl StartWorkflow {
    /// Populate from the engine's view of the run; input payloads become raw
    /// worker arguments.
    pub fn from_environment(
        info: &WorkflowExecutionInfo,
        input: &Payloads,
        dc: &dyn DataConverter,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: info.workflow_type.clone(),
            workflow_id: info.workflow_id.clone(),
            run_id: info.run_id.clone(),
            task_queue: info.task_queue.clone(),
            input: dc.from_payloads(input)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeSignal {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeQuery {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestroyWorkflow {
    #[serde(rename = "runId")]
    pub run_id: String,
}

/// Schedule an activity from workflow code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteActivity {
    pub name: String,
    #[serde(rename = "arguments", default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub options: ActivityOptions,
    /// `args` in engine payload form, filled in by [`parse_command`].
    #[serde(skip)]
    pub args_payload: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTimer {
    pub ms: u64,
}

impl NewTimer {
    pub fn to_duration(&self) -> Duration {
        Duration::from_millis(self.ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteWorkflow {
    #[serde(default)]
    pub result: Vec<Value>,
    #[serde(skip)]
    pub result_payload: Payloads,
}

/// Cancel previously issued commands, by command id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteChildWorkflow {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub options: ChildWorkflowOptions,
    #[serde(skip)]
    pub args_payload: Payloads,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalExternalWorkflow {
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "workflowID")]
    pub workflow_id: String,
    #[serde(rename = "runID", default)]
    pub run_id: String,
    pub signal: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(rename = "childWorkflowOnly", default)]
    pub child_workflow_only: bool,
    #[serde(skip)]
    pub args_payload: Payloads,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetWorkerInfo(GetWorkerInfo),
    InvokeActivity(InvokeActivity),
    StartWorkflow(StartWorkflow),
    InvokeSignal(InvokeSignal),
    InvokeQuery(InvokeQuery),
    DestroyWorkflow(DestroyWorkflow),
    ExecuteActivity(ExecuteActivity),
    NewTimer(NewTimer),
    CompleteWorkflow(CompleteWorkflow),
    Cancel(Cancel),
    ExecuteChildWorkflow(ExecuteChildWorkflow),
    SignalExternalWorkflow(SignalExternalWorkflow),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetWorkerInfo(_) => GET_WORKER_INFO,
            Self::InvokeActivity(_) => INVOKE_ACTIVITY,
            Self::StartWorkflow(_) => START_WORKFLOW,
            Self::InvokeSignal(_) => INVOKE_SIGNAL,
            Self::InvokeQuery(_) => INVOKE_QUERY,
            Self::DestroyWorkflow(_) => DESTROY_WORKFLOW,
            Self::ExecuteActivity(_) => EXECUTE_ACTIVITY,
            Self::NewTimer(_) => NEW_TIMER,
            Self::CompleteWorkflow(_) => COMPLETE_WORKFLOW,
            Self::Cancel(_) => CANCEL,
            Self::ExecuteChildWorkflow(_) => EXECUTE_CHILD_WORKFLOW,
            Self::SignalExternalWorkflow(_) => SIGNAL_EXTERNAL_WORKFLOW,
        }
    }

    /// Commands only the bridge may send; a worker emitting one is a protocol error.
    pub fn is_bridge_issued(&self) -> bool {
        matches!(
            self,
            Self::GetWorkerInfo(_)
                | Self::InvokeActivity(_)
                | Self::StartWorkflow(_)
                | Self::InvokeSignal(_)
                | Self::InvokeQuery(_)
                | Self::DestroyWorkflow(_)
        )
    }

    pub fn encode_options(&self) -> Result<RawOptions, ProtocolError> {
        let bytes = match self {
            Self::GetWorkerInfo(c) => serde_json::to_vec(c),
            Self::InvokeActivity(c) => serde_json::to_vec(c),
            Self::StartWorkflow(c) => serde_json::to_vec(c),
            Self::InvokeSignal(c) => serde_json::to_vec(c),
            Self::InvokeQuery(c) => serde_json::to_vec(c),
            Self::DestroyWorkflow(c) => serde_json::to_vec(c),
            Self::ExecuteActivity(c) => serde_json::to_vec(c),
            Self::NewTimer(c) => serde_json::to_vec(c),
            Self::CompleteWorkflow(c) => serde_json::to_vec(c),
            Self::Cancel(c) => serde_json::to_vec(c),
            Self::ExecuteChildWorkflow(c) => serde_json::to_vec(c),
            Self::SignalExternalWorkflow(c) => serde_json::to_vec(c),
        }
        .map_err(|e| ProtocolError::Malformed(format!("encode {} options: {}", self.name(), e)))?;
        Ok(RawOptions(bytes))
    }
}

macro_rules! impl_from_command {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Command {
                fn from(cmd: $variant) -> Self {
                    Command::$variant(cmd)
                }
            }
        )*
    };
}

impl_from_command!(
    GetWorkerInfo,
    InvokeActivity,
    StartWorkflow,
    InvokeSignal,
    InvokeQuery,
    DestroyWorkflow,
    ExecuteActivity,
    NewTimer,
    CompleteWorkflow,
    Cancel,
    ExecuteChildWorkflow,
    SignalExternalWorkflow,
);

fn decode<T: serde::de::DeserializeOwned>(name: &str, options: &[u8]) -> Result<T, ProtocolError> {
    let options: &[u8] = if options.is_empty() { b"{}" } else { options };
    serde_json::from_slice(options)
        .map_err(|e| ProtocolError::Malformed(format!("invalid {} options: {}", name, e)))
}

/// Map a command name and its JSON options to a typed command, converting
/// raw worker arguments into engine payloads.
pub fn parse_command(
    dc: &dyn DataConverter,
    name: &str,
    options: &[u8],
) -> Result<Command, ProtocolError> {
    let cmd = match name {
        GET_WORKER_INFO => Command::GetWorkerInfo(decode(name, options)?),
        INVOKE_ACTIVITY => Command::InvokeActivity(decode(name, options)?),
        START_WORKFLOW => Command::StartWorkflow(decode(name, options)?),
        INVOKE_SIGNAL => Command::InvokeSignal(decode(name, options)?),
        INVOKE_QUERY => Command::InvokeQuery(decode(name, options)?),
        DESTROY_WORKFLOW => Command::DestroyWorkflow(decode(name, options)?),
        EXECUTE_ACTIVITY => {
            let mut cmd: ExecuteActivity = decode(name, options)?;
            cmd.args_payload = dc.to_payloads(&cmd.args)?;
            Command::ExecuteActivity(cmd)
        }
        NEW_TIMER => Command::NewTimer(decode(name, options)?),
        COMPLETE_WORKFLOW => {
            let mut cmd: CompleteWorkflow = decode(name, options)?;
            cmd.result_payload = dc.to_payloads(&cmd.result)?;
            Command::CompleteWorkflow(cmd)
        }
        CANCEL => Command::Cancel(decode(name, options)?),
        EXECUTE_CHILD_WORKFLOW => {
            let mut cmd: ExecuteChildWorkflow = decode(name, options)?;
            cmd.args_payload = dc.to_payloads(&cmd.args)?;
            Command::ExecuteChildWorkflow(cmd)
        }
        SIGNAL_EXTERNAL_WORKFLOW => {
            let mut cmd: SignalExternalWorkflow = decode(name, options)?;
            cmd.args_payload = dc.to_payloads(&cmd.args)?;
            Command::SignalExternalWorkflow(cmd)
        }
        other => {
            return Err(ProtocolError::UndefinedCommand {
                name: other.to_string(),
            });
        }
    };

    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::JsonDataConverter;
    use serde_json::json;

    #[test]
    fn unknown_command_carries_its_name() {
        let err = parse_command(&JsonDataConverter, "SpawnDragons", b"{}").unwrap_err();
        match &err {
            ProtocolError::UndefinedCommand { name } => assert_eq!(name, "SpawnDragons"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("undefined command type"));
        assert!(err.to_string().contains("SpawnDragons"));
    }

    #[test]
    fn parsing_is_idempotent() {
        let options = br#"{"name":"Echo","arguments":["hi",{"n":1}],"options":{"TaskQueue":"default"}}"#;
        let first = parse_command(&JsonDataConverter, EXECUTE_ACTIVITY, options).unwrap();
        let second = parse_command(&JsonDataConverter, EXECUTE_ACTIVITY, options).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn activity_arguments_round_trip_through_converter() {
        let dc = JsonDataConverter;
        let cmd = parse_command(
            &dc,
            EXECUTE_ACTIVITY,
            br#"{"name":"Echo","arguments":["hi",42,null]}"#,
        )
        .unwrap();

        let Command::ExecuteActivity(cmd) = cmd else {
            panic!("expected ExecuteActivity");
        };
        assert_eq!(cmd.name, "Echo");
        assert_eq!(cmd.args_payload.len(), 3);
        assert_eq!(
            dc.from_payloads(&cmd.args_payload).unwrap(),
            vec![json!("hi"), json!(42), json!(null)]
        );
    }

    #[test]
    fn workflow_result_round_trips_through_converter() {
        let dc = JsonDataConverter;
        let cmd = parse_command(&dc, COMPLETE_WORKFLOW, br#"{"result":[{"total":3}]}"#).unwrap();
        let Command::CompleteWorkflow(cmd) = cmd else {
            panic!("expected CompleteWorkflow");
        };
        assert_eq!(dc.from_payloads(&cmd.result_payload).unwrap(), vec![json!({"total": 3})]);
    }

    #[test]
    fn timer_converts_to_duration() {
        let cmd = parse_command(&JsonDataConverter, NEW_TIMER, br#"{"ms":1500}"#).unwrap();
        assert_eq!(cmd, Command::NewTimer(NewTimer { ms: 1500 }));
        let Command::NewTimer(timer) = cmd else {
            unreachable!()
        };
        assert_eq!(timer.to_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn workflow_arguments_round_trip_through_start_command() {
        let dc = JsonDataConverter;
        let input = dc.to_payloads(&[json!("Hello World"), json!([1, 2])]).unwrap();
        let info = WorkflowExecutionInfo {
            workflow_type: "SimpleWorkflow".to_string(),
            workflow_id: "wf-1".to_string(),
            run_id: "run-1".to_string(),
            task_queue: "default".to_string(),
            namespace: "default".to_string(),
        };

        let start = StartWorkflow::from_environment(&info, &input, &dc).unwrap();
        let options = Command::from(start.clone()).encode_options().unwrap();
        insta::assert_json_snapshot!(
            serde_json::from_slice::<Value>(options.as_bytes()).unwrap(),
            @r#"
        {
          "args": [
            "Hello World",
            [
              1,
              2
            ]
          ],
          "name": "SimpleWorkflow",
          "rid": "run-1",
          "taskQueue": "default",
          "wid": "wf-1"
        }
        "#
        );

        let parsed = parse_command(&dc, START_WORKFLOW, options.as_bytes()).unwrap();
        assert_eq!(parsed, Command::StartWorkflow(start.clone()));
        assert_eq!(dc.to_payloads(&start.input).unwrap(), input);
    }

    #[test]
    fn malformed_options_are_protocol_errors() {
        let err = parse_command(&JsonDataConverter, NEW_TIMER, br#"{"ms":"soon"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn bridge_issued_commands_are_flagged() {
        assert!(Command::from(DestroyWorkflow::default()).is_bridge_issued());
        assert!(!Command::from(Cancel { ids: vec![1] }).is_bridge_issued());
    }
}
