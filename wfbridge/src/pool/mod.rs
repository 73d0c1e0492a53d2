//! Worker pool contract.
//!
//! A pool runs N worker processes and moves one [`Exchange`] at a time to
//! whichever worker is idle. The bridge never talks to a process directly.

mod process;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::codec::WireFormat;
use crate::bridge::protocol::Exchange;
use crate::config::PoolConfig;

pub use process::{CommandSpawner, ProcessPool, ProcessPoolFactory, WorkerSpawner};

/// Environment variable telling a worker which role it plays.
pub const ENV_MODE: &str = "RR_MODE";
/// Environment variable telling a worker which wire format to speak.
pub const ENV_CODEC: &str = "RR_CODEC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    Activities,
    Workflow,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activities => "activities",
            Self::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment handed to every worker before its first exchange.
pub fn worker_env(
    mode: WorkerMode,
    format: WireFormat,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = extra.clone();
    env.insert(ENV_MODE.to_string(), mode.as_str().to_string());
    env.insert(ENV_CODEC.to_string(), format.name().to_string());
    env
}

/// Unique identifier for a worker process within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Ready,
    Working,
    Errored,
    Stopped,
}

/// Snapshot of one worker process for the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub id: WorkerId,
    pub pid: u32,
    pub mode: WorkerMode,
    pub status: WorkerStatus,
    pub num_execs: u64,
    pub created_at: DateTime<Utc>,
}

/// Pool-side failures the lifecycle reacts to.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    WorkerError {
        mode: WorkerMode,
        worker: WorkerId,
        error: String,
    },
    PoolError {
        mode: WorkerMode,
        error: String,
    },
}

pub type PoolEventSender = mpsc::UnboundedSender<PoolEvent>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("no live workers left in pool")]
    NoWorkers,
    #[error("no worker became available within {0:?}")]
    AllocateTimeout(std::time::Duration),
    #[error("worker i/o failed: {0}")]
    Io(String),
    #[error("worker {0} crashed")]
    WorkerCrashed(WorkerId),
    #[error("exchange with worker {0} was abandoned")]
    Abandoned(WorkerId),
    #[error("pool has been destroyed")]
    Destroyed,
}

#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Send one exchange to an idle worker and wait for its reply.
    async fn exec(&self, exchange: Exchange) -> Result<Exchange, PoolError>;

    fn workers(&self) -> Vec<ProcessState>;

    /// Stop accepting work, let in-flight exchanges finish, stop processes.
    async fn destroy(&self) -> Result<(), PoolError>;
}

/// Creates pools; one call per pool per generation.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn create(
        &self,
        mode: WorkerMode,
        config: &PoolConfig,
        env: HashMap<String, String>,
        events: PoolEventSender,
    ) -> Result<Arc<dyn WorkerPool>, PoolError>;
}
