//! What the workers can run, and registering it with the engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::Codec;
use crate::bridge::command::GetWorkerInfo;
use crate::bridge::protocol::{Context, Message};
use crate::bridge::sequence::SequenceCounter;
use crate::engine::{
    ActivityHandler, Engine, EngineWorker, WorkerOptions, WorkflowDefinitionFactory,
};
use crate::error::{BridgeError, ProtocolError};
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisteredActivity {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisteredWorkflow {
    pub name: String,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub signals: Vec<String>,
}

/// One task queue as described by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerInfo {
    pub task_queue: String,
    #[serde(default)]
    pub options: WorkerOptions,
    #[serde(default)]
    pub activities: Vec<RegisteredActivity>,
    #[serde(default)]
    pub workflows: Vec<RegisteredWorkflow>,
}

/// Ask a pool to describe itself. Every result payload is one [`WorkerInfo`].
pub async fn fetch_worker_info(
    codec: &Codec,
    pool: &dyn WorkerPool,
    sequence: &SequenceCounter,
    version: &str,
) -> Result<Vec<WorkerInfo>, BridgeError> {
    let request = Message::command(
        sequence.next(),
        GetWorkerInfo {
            version: version.to_string(),
        },
        Default::default(),
    );

    let results = codec
        .execute(pool, &Context::default(), vec![request])
        .await?;
    let [result]: [Message; 1] = results.try_into().map_err(|v: Vec<Message>| {
        ProtocolError::ResultCount {
            expected: 1,
            actual: v.len(),
        }
    })?;

    if let Some(failure) = result.failure {
        return Err(BridgeError::Application(
            codec.converter().failure_to_error(&failure),
        ));
    }

    codec
        .converter()
        .from_payloads(&result.payloads)?
        .into_iter()
        .map(|value| {
            serde_json::from_value::<WorkerInfo>(value).map_err(|e| {
                BridgeError::from(ProtocolError::Malformed(format!("worker info: {}", e)))
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
struct QueueEntry {
    options: WorkerOptions,
    activities: Vec<String>,
    workflows: Vec<RegisteredWorkflow>,
}

/// Names advertised by one pool generation, grouped by task queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalogue {
    queues: BTreeMap<String, QueueEntry>,
}

impl Catalogue {
    /// Workflows come from the workflow pool, activities from the activity
    /// pool. Options of the workflow pool win for a shared queue.
    pub fn merge(workflow_infos: Vec<WorkerInfo>, activity_infos: Vec<WorkerInfo>) -> Self {
        let mut queues: BTreeMap<String, QueueEntry> = BTreeMap::new();

        for info in workflow_infos {
            let entry = queues.entry(info.task_queue).or_default();
            entry.options = info.options;
            entry.workflows.extend(info.workflows);
        }

        for info in activity_infos {
            let fresh = !queues.contains_key(&info.task_queue);
            let entry = queues.entry(info.task_queue).or_default();
            if fresh {
                entry.options = info.options;
            }
            entry
                .activities
                .extend(info.activities.into_iter().map(|a| a.name));
        }

        Self { queues }
    }

    pub fn task_queues(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn activity_names(&self) -> Vec<String> {
        self.queues
            .values()
            .flat_map(|q| q.activities.iter().cloned())
            .collect()
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.queues
            .values()
            .flat_map(|q| q.workflows.iter().map(|w| w.name.clone()))
            .collect()
    }

    /// Create one engine worker per task queue with every advertised name
    /// bound to the bridge entry points. Workers are returned unstarted.
    pub fn register(
        &self,
        engine: &dyn Engine,
        activities: Arc<dyn ActivityHandler>,
        workflows: Arc<dyn WorkflowDefinitionFactory>,
        graceful_timeout: Duration,
    ) -> Result<Vec<Box<dyn EngineWorker>>, BridgeError> {
        let mut workers = Vec::with_capacity(self.queues.len());

        for (task_queue, entry) in &self.queues {
            let mut options = entry.options.clone();
            options.worker_stop_timeout = graceful_timeout;
            let mut worker = engine.new_worker(task_queue, options)?;

            for workflow in &entry.workflows {
                worker.register_workflow(&workflow.name, Arc::clone(&workflows))?;
            }
            for name in &entry.activities {
                worker.register_activity(name, Arc::clone(&activities))?;
            }

            tracing::debug!(
                task_queue = %task_queue,
                workflows = entry.workflows.len(),
                activities = entry.activities.len(),
                "Engine worker registered"
            );
            workers.push(worker);
        }

        Ok(workers)
    }
}
