//! wfbridge: execution bridge between a workflow engine and out-of-process
//! worker pools.

pub mod activity;
pub mod backoff;
pub mod bridge;
pub mod catalogue;
pub mod config;
pub mod converter;
pub mod engine;
pub mod error;
pub mod generation;
pub mod pool;
pub mod service;
pub mod telemetry;
pub mod workflow;

#[cfg(test)]
mod testing;

/// Bridge version, advertised to workers during catalogue discovery.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use activity::ActivityBridge;
pub use bridge::codec::{Codec, WireFormat};
pub use config::{BridgeConfig, PoolConfig};
pub use converter::{DataConverter, JsonDataConverter, Payload, Payloads};
pub use engine::{
    ActivityContext, ActivityHandler, ActivityOutcome, ApplicationError, Engine, EngineWorker,
    WorkflowDefinition, WorkflowDefinitionFactory, WorkflowEnvironment,
};
pub use error::{BridgeError, ProtocolError};
pub use pool::{PoolEvent, PoolFactory, ProcessState, WorkerMode, WorkerPool};
pub use service::{BridgeService, LifecycleError, LifecycleState};
pub use workflow::WorkflowBridge;
